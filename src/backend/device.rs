//! The device seam used by the compute pipeline
//!
//! Every pipeline stage talks to the GPU through [`ComputeDevice`]. The
//! `ash`-backed [`VulkanDevice`](super::vulkan::VulkanDevice) drives real
//! hardware; [`SoftwareDevice`](super::software::SoftwareDevice) executes the
//! same calls against host memory for tests and dry runs.

use std::ptr::NonNull;
use std::time::Duration;

use ash::vk;

use crate::backend::commands::GpuOp;
use crate::backend::error::DeviceResult;
use crate::compute::memory_type::MemoryTable;

/// Which entry point answers buffer device address queries
///
/// Resolved once when the device is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AddressSource {
    /// `vkGetBufferDeviceAddress` (Vulkan 1.2 core)
    Core,
    /// `vkGetBufferDeviceAddressKHR`
    Khr,
    /// `vkGetBufferDeviceAddressEXT`
    Ext,
}

impl AddressSource {
    pub fn entry_point(&self) -> &'static str {
        match self {
            AddressSource::Core => "vkGetBufferDeviceAddress",
            AddressSource::Khr => "vkGetBufferDeviceAddressKHR",
            AddressSource::Ext => "vkGetBufferDeviceAddressEXT",
        }
    }
}

/// Pick the address entry point from what the device advertises
///
/// Core wins when the API version is at least 1.2, then the KHR extension,
/// then the older EXT extension.
pub fn resolve_address_source(
    api_version: u32,
    has_khr_extension: bool,
    has_ext_extension: bool,
) -> Option<AddressSource> {
    if api_version >= vk::API_VERSION_1_2 {
        Some(AddressSource::Core)
    } else if has_khr_extension {
        Some(AddressSource::Khr)
    } else if has_ext_extension {
        Some(AddressSource::Ext)
    } else {
        None
    }
}

/// A device object that must be destroyed exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceObject {
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    DescriptorPool(vk::DescriptorPool),
    /// Destroying the pool frees every command buffer allocated from it
    CommandPool(vk::CommandPool),
    Fence(vk::Fence),
}

impl DeviceObject {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceObject::Buffer(_) => "buffer",
            DeviceObject::Memory(_) => "device memory",
            DeviceObject::ShaderModule(_) => "shader module",
            DeviceObject::DescriptorSetLayout(_) => "descriptor set layout",
            DeviceObject::PipelineLayout(_) => "pipeline layout",
            DeviceObject::Pipeline(_) => "compute pipeline",
            DeviceObject::DescriptorPool(_) => "descriptor pool",
            DeviceObject::CommandPool(_) => "command pool",
            DeviceObject::Fence(_) => "fence",
        }
    }
}

/// Parameters for `vkCreateBuffer`
///
/// Sharing is always exclusive to the device's compute queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// Parameters for `vkAllocateMemory`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    /// Chain `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`
    pub device_address: bool,
}

/// Compute program creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ComputeStageDesc<'a> {
    pub module: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub entry_point: &'a std::ffi::CStr,
    /// Specialization constant 0
    pub element_count: u32,
}

/// Host-visible GPU interface used by every pipeline stage
///
/// Methods mirror the Vulkan entry points they wrap. Object-creating methods
/// return the new handle and leave ownership with the caller; objects are
/// released through [`ComputeDevice::destroy`].
pub trait ComputeDevice {
    /// Memory type and heap table reported by the physical device
    fn memory_table(&self) -> &MemoryTable;

    /// Queue family used for transfer and compute work
    fn queue_family_index(&self) -> u32;

    /// Entry point chosen for device address queries, if any
    fn address_source(&self) -> Option<AddressSource>;

    /// `maxComputeWorkGroupCount[0]`
    fn max_workgroup_count_x(&self) -> u32;

    fn create_buffer(&self, desc: &BufferDesc) -> DeviceResult<vk::Buffer>;

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn allocate_memory(&self, desc: &MemoryDesc) -> DeviceResult<vk::DeviceMemory>;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DeviceResult<()>;

    /// Map `size` bytes of host-visible memory starting at `offset`
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> DeviceResult<NonNull<u8>>;

    fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Raw device address of a buffer created with shader-device-address usage
    fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceResult<vk::DeviceAddress>;

    fn create_shader_module(&self, code: &[u32]) -> DeviceResult<vk::ShaderModule>;

    /// Layout with a single compute-stage storage buffer at binding 0
    fn create_storage_set_layout(&self) -> DeviceResult<vk::DescriptorSetLayout>;

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::PipelineLayout>;

    fn create_compute_pipeline(&self, stage: &ComputeStageDesc<'_>) -> DeviceResult<vk::Pipeline>;

    /// Pool sized for one set with one storage buffer descriptor
    fn create_descriptor_pool(&self) -> DeviceResult<vk::DescriptorPool>;

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::DescriptorSet>;

    /// Point binding 0 of `set` at `range` bytes of `buffer`
    fn write_storage_descriptor(
        &self,
        set: vk::DescriptorSet,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    );

    fn create_command_pool(&self) -> DeviceResult<vk::CommandPool>;

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DeviceResult<vk::CommandBuffer>;

    /// Begin a one-time-submit recording
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()>;

    fn record(&self, cmd: vk::CommandBuffer, op: &GpuOp);

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()>;

    /// Create an unsignaled fence
    fn create_fence(&self) -> DeviceResult<vk::Fence>;

    fn queue_submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> DeviceResult<()>;

    /// Block until `fence` signals or `timeout` elapses
    ///
    /// Returns `Ok(true)` when signaled and `Ok(false)` on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> DeviceResult<bool>;

    /// Drain all queued work on the device
    fn wait_idle(&self) -> DeviceResult<()>;

    fn destroy(&self, object: DeviceObject);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_wins_from_vulkan_1_2() {
        assert_eq!(
            resolve_address_source(vk::API_VERSION_1_2, true, true),
            Some(AddressSource::Core)
        );
        assert_eq!(
            resolve_address_source(vk::API_VERSION_1_3, false, false),
            Some(AddressSource::Core)
        );
    }

    #[test]
    fn test_extension_fallback_order() {
        assert_eq!(
            resolve_address_source(vk::API_VERSION_1_1, true, true),
            Some(AddressSource::Khr)
        );
        assert_eq!(
            resolve_address_source(vk::API_VERSION_1_1, false, true),
            Some(AddressSource::Ext)
        );
        assert_eq!(resolve_address_source(vk::API_VERSION_1_0, false, false), None);
    }

    #[test]
    fn test_entry_point_names() {
        assert_eq!(AddressSource::Core.entry_point(), "vkGetBufferDeviceAddress");
        assert_eq!(AddressSource::Ext.entry_point(), "vkGetBufferDeviceAddressEXT");
    }
}
