//! Device address capture
//!
//! The compute program reaches its working buffers through raw device
//! addresses. They are queried once per run and written into the address
//! table region at the end of the staging buffer, from where the upload copy
//! moves them into the device-local address table buffer.

use ash::vk;

use crate::backend::device::ComputeDevice;
use crate::compute::allocator::{RunBuffers, ADDRESS_TABLE_SIZE};
use crate::compute::scope::MappedMemory;
use crate::error::{ForgeError, ForgeResult};

const ENTRY_SIZE: usize = std::mem::size_of::<vk::DeviceAddress>();

/// Ordered device addresses as the compute program sees them
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AddressTable {
    entries: Vec<vk::DeviceAddress>,
}

impl AddressTable {
    /// Entries that fit in the reserved region
    pub const CAPACITY: usize = ADDRESS_TABLE_SIZE as usize / ENTRY_SIZE;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, address: vk::DeviceAddress) -> ForgeResult<()> {
        if self.entries.len() == Self::CAPACITY {
            return Err(ForgeError::InvalidConfiguration(format!(
                "address table holds at most {} entries",
                Self::CAPACITY
            )));
        }
        self.entries.push(address);
        Ok(())
    }

    pub fn entries(&self) -> &[vk::DeviceAddress] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the entries into `region` in native byte order, zero-filling the rest
    pub fn write_to(&self, region: &mut [u8]) {
        region.fill(0);
        let bytes: &[u8] = bytemuck::cast_slice(&self.entries);
        let len = bytes.len().min(region.len());
        region[..len].copy_from_slice(&bytes[..len]);
    }

    /// Read the first `count` entries back out of `region`
    pub fn read_from(region: &[u8], count: usize) -> Self {
        let entries = region
            .chunks_exact(ENTRY_SIZE)
            .take(count.min(Self::CAPACITY))
            .map(bytemuck::pod_read_unaligned::<vk::DeviceAddress>)
            .collect();
        Self { entries }
    }
}

/// Query the working buffers' addresses and write them into the staging table
///
/// Requires the staging mapping, so the addresses are in place before the
/// mapping is dropped and before any copy is recorded. Entry 0 is the
/// result buffer, entry 1 the source buffer.
pub fn capture_addresses<D: ComputeDevice + ?Sized>(
    device: &D,
    buffers: &RunBuffers,
    staging: &mut MappedMemory<'_, D>,
) -> ForgeResult<AddressTable> {
    let Some(source) = device.address_source() else {
        tracing::error!("capture_addresses: no buffer device address entry point");
        return Err(ForgeError::AddressQueryUnsupported);
    };

    let mut table = AddressTable::new();
    for resource in buffers.working() {
        let address = device.buffer_device_address(resource.buffer)?;
        tracing::info!(
            "capture_addresses: {} -> {:#x}",
            source.entry_point(),
            address
        );
        table.push(address)?;
    }

    let start = buffers.table_region_offset() as usize;
    let end = start + ADDRESS_TABLE_SIZE as usize;
    let region = staging
        .bytes_mut()
        .get_mut(start..end)
        .ok_or_else(|| ForgeError::InvalidConfiguration("staging mapping too small".to_string()))?;
    table.write_to(region);

    Ok(table)
}
