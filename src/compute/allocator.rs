//! Buffer and memory allocation for one compute run
//!
//! Four buffers back a run:
//!
//! | buffer        | memory                       | size                   |
//! |---------------|------------------------------|------------------------|
//! | staging       | host-visible, host-coherent  | payload + address table |
//! | result (A)    | device-local, shared block   | payload                |
//! | source (B)    | device-local, shared block   | payload                |
//! | address table | device-local                 | address table          |
//!
//! The two working buffers alias one allocation at disjoint offsets. Only
//! that allocation carries the device-address allocation flag.

use ash::vk;

use crate::backend::device::{BufferDesc, ComputeDevice, DeviceObject, MemoryDesc};
use crate::compute::memory_type::select_memory_type;
use crate::compute::scope::{MappedMemory, ResourceScope, ScopeSlot};
use crate::error::{ForgeError, ForgeResult};

/// Bytes reserved for device addresses at the end of the staging buffer
pub const ADDRESS_TABLE_SIZE: vk::DeviceSize = 64;

const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

const WORKING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

const TABLE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// One device memory allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub heap_index: u32,
}

/// A buffer bound once to a [`MemoryBlock`] at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
}

impl BufferResource {
    /// Byte range occupied inside its memory block
    pub fn range(&self) -> std::ops::Range<vk::DeviceSize> {
        self.offset..self.offset + self.size
    }
}

/// Every buffer and allocation of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBuffers {
    pub payload_size: vk::DeviceSize,
    pub staging: BufferResource,
    pub staging_memory: MemoryBlock,
    /// Working buffer A, receives the program output
    pub result: BufferResource,
    /// Working buffer B, holds the uploaded input
    pub source: BufferResource,
    pub working_memory: MemoryBlock,
    pub address_table: BufferResource,
    pub table_memory: MemoryBlock,
}

impl RunBuffers {
    /// Offset of the address table region inside the staging buffer
    pub fn table_region_offset(&self) -> vk::DeviceSize {
        self.payload_size
    }

    /// Working buffers in creation order
    pub fn working(&self) -> [&BufferResource; 2] {
        [&self.result, &self.source]
    }
}

/// Creates, sizes and binds the buffers of a run
///
/// Every object is handed to the scope as soon as it exists, so a failure
/// part way through leaves the earlier objects for the scope to release.
pub struct ResourceAllocator<'s, 'd, D: ComputeDevice + ?Sized> {
    scope: &'s mut ResourceScope<'d, D>,
}

impl<'s, 'd, D: ComputeDevice + ?Sized> ResourceAllocator<'s, 'd, D> {
    pub fn new(scope: &'s mut ResourceScope<'d, D>) -> Self {
        Self { scope }
    }

    pub fn allocate(mut self, payload_size: vk::DeviceSize) -> ForgeResult<RunBuffers> {
        if payload_size == 0 {
            return Err(ForgeError::InvalidConfiguration(
                "payload size must be non-zero".to_string(),
            ));
        }
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        // Staging buffer, private host-visible block
        let staging_slot = self.scope.reserve("staging memory");
        let staging_size = payload_size + ADDRESS_TABLE_SIZE;
        let staging = self.create_buffer("staging buffer", staging_size, STAGING_USAGE)?;
        let req = self.device().buffer_memory_requirements(staging);
        let staging_memory = self.allocate_block(
            "staging memory",
            staging_slot,
            req.memory_type_bits,
            host,
            req.size,
            false,
        )?;
        let staging = self.bind(
            "staging buffer",
            staging,
            staging_size,
            STAGING_USAGE,
            &staging_memory,
            0,
        )?;

        // Working buffers A and B, one device-local block
        let working_slot = self.scope.reserve("working memory");
        let result = self.create_buffer("result buffer", payload_size, WORKING_USAGE)?;
        let source = self.create_buffer("source buffer", payload_size, WORKING_USAGE)?;
        let req_a = self.device().buffer_memory_requirements(result);
        let req_b = self.device().buffer_memory_requirements(source);
        let source_offset = align_up(req_a.size, req_b.alignment);
        let working_size = (2 * payload_size).max(source_offset + req_b.size);
        let working_memory = self.allocate_block(
            "working memory",
            working_slot,
            req_a.memory_type_bits & req_b.memory_type_bits,
            local,
            working_size,
            true,
        )?;
        let result = self.bind(
            "result buffer",
            result,
            payload_size,
            WORKING_USAGE,
            &working_memory,
            0,
        )?;
        let source = self.bind(
            "source buffer",
            source,
            payload_size,
            WORKING_USAGE,
            &working_memory,
            source_offset,
        )?;

        // Address table buffer, private device-local block
        let table_slot = self.scope.reserve("address table memory");
        let table = self.create_buffer("address table buffer", ADDRESS_TABLE_SIZE, TABLE_USAGE)?;
        let req = self.device().buffer_memory_requirements(table);
        let table_memory = self.allocate_block(
            "address table memory",
            table_slot,
            req.memory_type_bits,
            local,
            req.size,
            false,
        )?;
        let address_table = self.bind(
            "address table buffer",
            table,
            ADDRESS_TABLE_SIZE,
            TABLE_USAGE,
            &table_memory,
            0,
        )?;

        tracing::info!(
            "ResourceAllocator::allocate: staging {} bytes, working {} bytes, table {} bytes",
            staging_size,
            working_size,
            ADDRESS_TABLE_SIZE
        );

        Ok(RunBuffers {
            payload_size,
            staging,
            staging_memory,
            result,
            source,
            working_memory,
            address_table,
            table_memory,
        })
    }

    fn device(&self) -> &'d D {
        self.scope.device()
    }

    fn create_buffer(
        &mut self,
        label: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> ForgeResult<vk::Buffer> {
        let buffer = self
            .device()
            .create_buffer(&BufferDesc { size, usage })
            .map_err(ForgeError::allocation(label))?;
        self.scope.adopt(DeviceObject::Buffer(buffer), label);
        tracing::debug!("ResourceAllocator: created {} ({} bytes)", label, size);
        Ok(buffer)
    }

    fn allocate_block(
        &mut self,
        label: &'static str,
        slot: ScopeSlot,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
        device_address: bool,
    ) -> ForgeResult<MemoryBlock> {
        let table = self.device().memory_table();
        let memory_type_index = select_memory_type(table, type_bits, required, size)?;
        let heap_index = table
            .types
            .get(memory_type_index as usize)
            .map(|t| t.heap_index)
            .unwrap_or_default();
        if let Some(heap) = table.heap_of(memory_type_index) {
            tracing::info!(
                "ResourceAllocator: {} uses memory type {} on heap {} ({} bytes, {} MB)",
                label,
                memory_type_index,
                heap_index,
                heap.size,
                heap.size / (1024 * 1024)
            );
        }

        let memory = self
            .device()
            .allocate_memory(&MemoryDesc {
                size,
                memory_type_index,
                device_address,
            })
            .map_err(ForgeError::allocation(label))?;
        self.scope.fill(slot, DeviceObject::Memory(memory));

        Ok(MemoryBlock {
            memory,
            size,
            memory_type_index,
            heap_index,
        })
    }

    fn bind(
        &mut self,
        label: &'static str,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        block: &MemoryBlock,
        offset: vk::DeviceSize,
    ) -> ForgeResult<BufferResource> {
        self.device()
            .bind_buffer_memory(buffer, block.memory, offset)
            .map_err(ForgeError::allocation(label))?;
        Ok(BufferResource {
            buffer,
            size,
            usage,
            memory: block.memory,
            offset,
        })
    }
}

/// Map the staging buffer and fill it for upload
///
/// The payload region gets element `i = i`, the address table region is
/// zeroed. The mapping is returned still open so device addresses can be
/// written into it before it is unmapped.
pub fn initialize_staging<'d, D: ComputeDevice + ?Sized>(
    device: &'d D,
    buffers: &RunBuffers,
) -> ForgeResult<MappedMemory<'d, D>> {
    let mut mapping = MappedMemory::map(
        device,
        buffers.staging_memory.memory,
        buffers.staging.offset,
        buffers.staging.size,
        "staging mapping",
    )?;

    let payload_words = (buffers.payload_size / 4) as usize;
    for (i, word) in mapping.words_mut()?[..payload_words].iter_mut().enumerate() {
        *word = i as u32;
    }
    let table_start = buffers.table_region_offset() as usize;
    mapping.bytes_mut()[table_start..].fill(0);

    tracing::debug!(
        "initialize_staging: {} elements written, {} table bytes zeroed",
        payload_words,
        ADDRESS_TABLE_SIZE
    );
    Ok(mapping)
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareDevice;
    use crate::compute::memory_type::{MemoryHeapInfo, MemoryTable, MemoryTypeInfo};

    const PAYLOAD: u64 = 4096 * 4;

    #[test]
    fn test_buffer_sizes_and_aliasing() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(PAYLOAD).unwrap();

        assert_eq!(buffers.staging.size, PAYLOAD + 64);
        assert_eq!(buffers.address_table.size, 64);
        assert_eq!(buffers.result.memory, buffers.source.memory);
        assert_eq!(buffers.result.offset, 0);
        assert!(buffers.source.offset >= buffers.result.size);
        assert!(buffers.working_memory.size >= 2 * PAYLOAD);
        assert!(buffers.source.range().end <= buffers.working_memory.size);
        assert_ne!(buffers.staging.memory, buffers.address_table.memory);
        assert_eq!(scope.live(), 7);
    }

    #[test]
    fn test_memory_types_follow_properties() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(PAYLOAD).unwrap();

        // Type 1 is the first host-visible coherent type of the default table.
        assert_eq!(buffers.staging_memory.memory_type_index, 1);
        assert_eq!(buffers.working_memory.memory_type_index, 0);
        assert_eq!(buffers.table_memory.memory_type_index, 0);
        assert_eq!(buffers.staging_memory.heap_index, 1);
    }

    #[test]
    fn test_unaligned_payload_is_padded() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(100 * 4).unwrap();

        assert_eq!(buffers.source.offset % 256, 0);
        assert!(buffers.working_memory.size >= buffers.source.range().end);
    }

    #[test]
    fn test_staging_initialization() {
        let device = SoftwareDevice::new();
        let mut scope = ResourceScope::new(&device);
        let buffers = ResourceAllocator::new(&mut scope).allocate(PAYLOAD).unwrap();

        let mapping = initialize_staging(&device, &buffers).unwrap();
        let words = mapping.words().unwrap();
        assert_eq!(words[0], 0);
        assert_eq!(words[4095], 4095);
        assert!(mapping.bytes()[PAYLOAD as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_missing_host_visible_type() {
        let table = MemoryTable::new(
            vec![MemoryTypeInfo {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            vec![MemoryHeapInfo {
                size: 1 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
        );
        let device = SoftwareDevice::new().with_memory_table(table);
        let mut scope = ResourceScope::new(&device);
        let err = ResourceAllocator::new(&mut scope)
            .allocate(PAYLOAD)
            .unwrap_err();

        assert!(matches!(err, ForgeError::NoCompatibleMemoryType { .. }));
        // The staging buffer was created and stays with the scope.
        assert_eq!(scope.labels(), vec!["staging buffer"]);
    }

    #[test]
    fn test_failed_bind_reports_resource() {
        let device = SoftwareDevice::new().with_failure(
            "vkBindBufferMemory",
            3,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        );
        let mut scope = ResourceScope::new(&device);
        let err = ResourceAllocator::new(&mut scope)
            .allocate(PAYLOAD)
            .unwrap_err();

        match err {
            ForgeError::AllocationFailed { resource, source } => {
                assert_eq!(resource, "source buffer");
                assert_eq!(source.code, -2);
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(scope);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.stats().usage_errors, 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(400, 256), 512);
        assert_eq!(align_up(512, 256), 512);
        assert_eq!(align_up(7, 0), 7);
    }
}
