//! Memory type selection
//!
//! Maps a buffer's compatibility bitmask, a required property set and a
//! minimum capacity onto a concrete memory type index of the device.

use ash::vk;

use crate::error::{ForgeError, ForgeResult};

/// One entry of the device's memory type table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One physical memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeapInfo {
    /// Heap capacity in bytes
    pub size: vk::DeviceSize,
    pub flags: vk::MemoryHeapFlags,
}

/// Owned copy of `VkPhysicalDeviceMemoryProperties`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTable {
    pub types: Vec<MemoryTypeInfo>,
    pub heaps: Vec<MemoryHeapInfo>,
}

impl MemoryTable {
    pub fn new(types: Vec<MemoryTypeInfo>, heaps: Vec<MemoryHeapInfo>) -> Self {
        Self { types, heaps }
    }

    pub fn from_vk(props: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|t| MemoryTypeInfo {
                property_flags: t.property_flags,
                heap_index: t.heap_index,
            })
            .collect();
        let heaps = props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|h| MemoryHeapInfo {
                size: h.size,
                flags: h.flags,
            })
            .collect();
        Self { types, heaps }
    }

    /// Heap backing memory type `index`
    pub fn heap_of(&self, index: u32) -> Option<&MemoryHeapInfo> {
        let ty = self.types.get(index as usize)?;
        self.heaps.get(ty.heap_index as usize)
    }

    /// Log every heap with its capacity
    pub fn log_heaps(&self) {
        for (i, heap) in self.heaps.iter().enumerate() {
            tracing::info!(
                heap = i,
                size_bytes = heap.size,
                size_mb = heap.size / (1024 * 1024),
                device_local = heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
                "memory heap {}: {} bytes ({} MB)",
                i,
                heap.size,
                heap.size / (1024 * 1024)
            );
        }
    }
}

/// Return the lowest memory type index that is allowed by `type_bits`, has
/// every flag in `required`, and sits on a heap of at least `min_size` bytes.
///
/// Candidates are scanned in ascending index order, which is the driver's
/// preference order; no further ranking is applied.
pub fn select_memory_type(
    table: &MemoryTable,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    min_size: vk::DeviceSize,
) -> ForgeResult<u32> {
    // Vulkan caps the table at 32 types, one per bit of `type_bits`.
    for (index, ty) in table.types.iter().enumerate().take(32) {
        if type_bits & (1u32 << index) == 0 {
            continue;
        }
        if !ty.property_flags.contains(required) {
            continue;
        }
        let Some(heap) = table.heaps.get(ty.heap_index as usize) else {
            continue;
        };
        if heap.size >= min_size {
            return Ok(index as u32);
        }
    }

    Err(ForgeError::NoCompatibleMemoryType {
        type_bits,
        required,
        min_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn discrete_gpu_table() -> MemoryTable {
        MemoryTable::new(
            vec![
                MemoryTypeInfo {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryTypeInfo {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryTypeInfo {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT
                        | vk::MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
                MemoryTypeInfo {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 2,
                },
            ],
            vec![
                MemoryHeapInfo {
                    size: 8 * GIB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeapInfo {
                    size: 16 * GIB,
                    flags: vk::MemoryHeapFlags::empty(),
                },
                MemoryHeapInfo {
                    size: 256 * 1024 * 1024,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
            ],
        )
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_heap_log_carries_byte_counts() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || discrete_gpu_table().log_heaps());

        let text = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("memory heap 2: 268435456 bytes (256 MB)"));
        assert!(text.contains("size_bytes=17179869184"));
    }

    #[test]
    fn test_selects_host_coherent_type() {
        let table = discrete_gpu_table();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(select_memory_type(&table, 0b1111, host, 1024).unwrap(), 1);
    }

    #[test]
    fn test_first_match_wins_over_bigger_heap() {
        let table = discrete_gpu_table();
        // Type 3 also qualifies but type 0 comes first.
        let idx = select_memory_type(&table, 0b1001, vk::MemoryPropertyFlags::DEVICE_LOCAL, 1)
            .unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_type_bits_exclude_candidates() {
        let table = discrete_gpu_table();
        let idx = select_memory_type(&table, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL, 1)
            .unwrap();
        assert_eq!(idx, 3);
    }

    #[test]
    fn test_heap_capacity_is_checked() {
        let table = discrete_gpu_table();
        // Type 3's heap is only 256 MB.
        let err = select_memory_type(
            &table,
            0b1000,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            512 * 1024 * 1024,
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::NoCompatibleMemoryType { .. }));
    }

    #[test]
    fn test_empty_bitmask_has_no_fallback() {
        let table = discrete_gpu_table();
        let err = select_memory_type(&table, 0, vk::MemoryPropertyFlags::empty(), 0).unwrap_err();
        match err {
            ForgeError::NoCompatibleMemoryType { type_bits, .. } => assert_eq!(type_bits, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_heap_of() {
        let table = discrete_gpu_table();
        assert_eq!(table.heap_of(2).unwrap().size, 16 * GIB);
        assert!(table.heap_of(9).is_none());
    }

    #[test]
    fn test_from_vk_respects_counts() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 1;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_heap_count = 1;
        props.memory_heaps[0].size = GIB;

        let table = MemoryTable::from_vk(&props);
        assert_eq!(table.types.len(), 1);
        assert_eq!(table.heaps.len(), 1);
        assert_eq!(table.heaps[0].size, GIB);
    }

    fn flag_set() -> impl Strategy<Value = vk::MemoryPropertyFlags> {
        (0u32..16).prop_map(vk::MemoryPropertyFlags::from_raw)
    }

    fn table_strategy() -> impl Strategy<Value = MemoryTable> {
        (
            prop::collection::vec((flag_set(), 0u32..4), 1..12),
            prop::collection::vec(0u64..(4 * GIB), 1..4),
        )
            .prop_map(|(types, heaps)| {
                let heap_count = heaps.len() as u32;
                MemoryTable::new(
                    types
                        .into_iter()
                        .map(|(property_flags, heap)| MemoryTypeInfo {
                            property_flags,
                            heap_index: heap % heap_count,
                        })
                        .collect(),
                    heaps
                        .into_iter()
                        .map(|size| MemoryHeapInfo {
                            size,
                            flags: vk::MemoryHeapFlags::empty(),
                        })
                        .collect(),
                )
            })
    }

    fn qualifies(
        table: &MemoryTable,
        index: usize,
        bits: u32,
        required: vk::MemoryPropertyFlags,
        min_size: u64,
    ) -> bool {
        let ty = &table.types[index];
        bits & (1 << index) != 0
            && ty.property_flags.contains(required)
            && table.heaps[ty.heap_index as usize].size >= min_size
    }

    proptest! {
        #[test]
        fn prop_returns_lowest_qualifying_index(
            table in table_strategy(),
            bits in any::<u32>(),
            required in flag_set(),
            min_size in 0u64..(4 * GIB),
        ) {
            let expected = (0..table.types.len())
                .find(|&i| qualifies(&table, i, bits, required, min_size));

            match select_memory_type(&table, bits, required, min_size) {
                Ok(index) => prop_assert_eq!(Some(index as usize), expected),
                Err(ForgeError::NoCompatibleMemoryType { .. }) => prop_assert_eq!(expected, None),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
