//! `ash`-backed [`ComputeDevice`]

use std::ffi::c_char;
use std::ptr::NonNull;
use std::time::Duration;

use ash::vk;

use crate::backend::commands::GpuOp;
use crate::backend::device::{
    resolve_address_source, AddressSource, BufferDesc, ComputeDevice, ComputeStageDesc,
    DeviceObject, MemoryDesc,
};
use crate::backend::error::{DeviceError, DeviceResult, VkResultExt};
use crate::backend::vulkan::instance::{format_version, PhysicalDeviceInfo, VulkanInstance};
use crate::compute::memory_type::MemoryTable;
use crate::compute::sequencer::LOCAL_WORKGROUP_SIZE;
use crate::config::RunConfig;
use crate::error::{ForgeError, ForgeResult};

/// Features and limits the run depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct DeviceCapabilities {
    pub buffer_device_address: bool,
    pub capture_replay: bool,
    pub multi_device: bool,
    pub shader_int64: bool,
    pub max_compute_invocations: u32,
    pub max_workgroup_size_x: u32,
    pub max_workgroup_count_x: u32,
}

impl DeviceCapabilities {
    /// Fail with `CapabilityMissing` when the run cannot execute here
    pub fn check(&self) -> ForgeResult<()> {
        if !self.buffer_device_address {
            return Err(ForgeError::CapabilityMissing(
                "bufferDeviceAddress feature".to_string(),
            ));
        }
        if !self.shader_int64 {
            return Err(ForgeError::CapabilityMissing(
                "shaderInt64 feature".to_string(),
            ));
        }
        if self.max_compute_invocations < LOCAL_WORKGROUP_SIZE
            || self.max_workgroup_size_x < LOCAL_WORKGROUP_SIZE
        {
            return Err(ForgeError::CapabilityMissing(format!(
                "workgroups of {} invocations (device allows {} total, {} in x)",
                LOCAL_WORKGROUP_SIZE, self.max_compute_invocations, self.max_workgroup_size_x
            )));
        }
        Ok(())
    }
}

/// First queue family that can run compute work
///
/// Compute-capable families always accept transfer commands as well.
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE) && f.queue_count > 0)
        .map(|i| i as u32)
}

enum AddressFns {
    Core,
    Khr(ash::khr::buffer_device_address::Device),
    Ext(ash::ext::buffer_device_address::Device),
}

impl AddressFns {
    fn source(&self) -> AddressSource {
        match self {
            AddressFns::Core => AddressSource::Core,
            AddressFns::Khr(_) => AddressSource::Khr,
            AddressFns::Ext(_) => AddressSource::Ext,
        }
    }
}

/// A logical device with one compute queue
///
/// Dropping it waits for the queue to drain, destroys the device and then
/// the instance.
pub struct VulkanDevice {
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    info: PhysicalDeviceInfo,
    capabilities: DeviceCapabilities,
    memory_table: MemoryTable,
    address: AddressFns,
    instance: VulkanInstance,
}

impl VulkanDevice {
    pub fn new(config: &RunConfig) -> ForgeResult<Self> {
        let limits = &config.limits;
        let instance = VulkanInstance::new(limits)?;

        let devices = instance.physical_devices(limits)?;
        tracing::info!("VulkanDevice: {} Vulkan device(s) detected", devices.len());
        for (_, info) in devices.iter() {
            tracing::info!("VulkanDevice: {}", info);
        }
        let Some((physical_device, info)) = devices.items.get(config.device_index).cloned() else {
            return Err(ForgeError::InvalidConfiguration(format!(
                "device index {} exceeds the {} available device(s)",
                config.device_index,
                devices.len()
            )));
        };
        tracing::info!("VulkanDevice: using device [{}] {}", info.index, info.name);

        let extensions = instance.device_extensions(physical_device, limits)?;
        let has_khr = extensions
            .iter()
            .any(|e| e.as_bytes() == ash::khr::buffer_device_address::NAME.to_bytes());
        let has_ext = extensions
            .iter()
            .any(|e| e.as_bytes() == ash::ext::buffer_device_address::NAME.to_bytes());
        let api_version = info.api_version.min(instance.api_version());
        let source = resolve_address_source(api_version, has_khr, has_ext).ok_or_else(|| {
            ForgeError::CapabilityMissing(format!(
                "buffer device address on Vulkan {} without VK_KHR/EXT_buffer_device_address",
                format_version(api_version)
            ))
        })?;
        tracing::info!("VulkanDevice: device addresses via {}", source.entry_point());

        let capabilities = query_capabilities(&instance, physical_device, source, api_version);
        if capabilities.capture_replay {
            tracing::info!("VulkanDevice: supports bufferDeviceAddressCaptureReplay");
        }
        if capabilities.multi_device {
            tracing::info!("VulkanDevice: supports bufferDeviceAddressMultiDevice");
        }
        tracing::info!(
            "VulkanDevice: max compute workgroup invocations {}, max workgroups in x {}",
            capabilities.max_compute_invocations,
            capabilities.max_workgroup_count_x
        );
        capabilities.check()?;

        let memory_table = MemoryTable::from_vk(&unsafe {
            instance
                .handle()
                .get_physical_device_memory_properties(physical_device)
        });
        memory_table.log_heaps();

        let families = instance.queue_families(physical_device, limits);
        let queue_family_index = select_queue_family(&families.items).ok_or_else(|| {
            ForgeError::CapabilityMissing("a queue family with compute support".to_string())
        })?;

        let device = create_logical_device(&instance, physical_device, queue_family_index, source)?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let address = match source {
            AddressSource::Core => AddressFns::Core,
            AddressSource::Khr => AddressFns::Khr(ash::khr::buffer_device_address::Device::new(
                instance.handle(),
                &device,
            )),
            AddressSource::Ext => AddressFns::Ext(ash::ext::buffer_device_address::Device::new(
                instance.handle(),
                &device,
            )),
        };
        tracing::info!(
            "VulkanDevice: logical device ready, queue family {}",
            queue_family_index
        );

        Ok(Self {
            device,
            queue,
            queue_family_index,
            info,
            capabilities,
            memory_table,
            address,
            instance,
        })
    }

    pub fn info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn has_validation_layer(&self) -> bool {
        self.instance.has_validation_layer()
    }
}

fn query_capabilities(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
    source: AddressSource,
    api_version: u32,
) -> DeviceCapabilities {
    let handle = instance.handle();
    let mut caps = DeviceCapabilities::default();

    if source == AddressSource::Ext {
        let mut bda = vk::PhysicalDeviceBufferDeviceAddressFeaturesEXT::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut bda);
        unsafe { handle.get_physical_device_features2(physical_device, &mut features2) };
        caps.shader_int64 = features2.features.shader_int64 == vk::TRUE;
        caps.buffer_device_address = bda.buffer_device_address == vk::TRUE;
        caps.capture_replay = bda.buffer_device_address_capture_replay == vk::TRUE;
        caps.multi_device = bda.buffer_device_address_multi_device == vk::TRUE;
    } else {
        let mut bda = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut bda);
        unsafe { handle.get_physical_device_features2(physical_device, &mut features2) };
        caps.shader_int64 = features2.features.shader_int64 == vk::TRUE;
        caps.buffer_device_address = bda.buffer_device_address == vk::TRUE;
        caps.capture_replay = bda.buffer_device_address_capture_replay == vk::TRUE;
        caps.multi_device = bda.buffer_device_address_multi_device == vk::TRUE;
    }

    let limits = if api_version >= vk::API_VERSION_1_2 {
        let mut driver = vk::PhysicalDeviceDriverProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut driver);
        unsafe { handle.get_physical_device_properties2(physical_device, &mut props2) };
        let limits = props2.properties.limits;
        tracing::info!(
            "VulkanDevice: driver {} {}",
            driver
                .driver_name_as_c_str()
                .map(|s| s.to_string_lossy())
                .unwrap_or_default(),
            driver
                .driver_info_as_c_str()
                .map(|s| s.to_string_lossy())
                .unwrap_or_default()
        );
        limits
    } else {
        unsafe { handle.get_physical_device_properties(physical_device) }.limits
    };
    caps.max_compute_invocations = limits.max_compute_work_group_invocations;
    caps.max_workgroup_size_x = limits.max_compute_work_group_size[0];
    caps.max_workgroup_count_x = limits.max_compute_work_group_count[0];
    caps
}

fn create_logical_device(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    source: AddressSource,
) -> ForgeResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities)];

    let extension_names: Vec<*const c_char> = match source {
        AddressSource::Core => Vec::new(),
        AddressSource::Khr => vec![ash::khr::buffer_device_address::NAME.as_ptr()],
        AddressSource::Ext => vec![ash::ext::buffer_device_address::NAME.as_ptr()],
    };

    let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(features);
    let mut bda =
        vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
    let mut bda_ext =
        vk::PhysicalDeviceBufferDeviceAddressFeaturesEXT::default().buffer_device_address(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);
    let create_info = match source {
        AddressSource::Ext => create_info.push_next(&mut bda_ext),
        AddressSource::Core | AddressSource::Khr => create_info.push_next(&mut bda),
    };

    let device = unsafe {
        instance
            .handle()
            .create_device(physical_device, &create_info, None)
    }
    .call("vkCreateDevice")?;
    Ok(device)
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("VulkanDevice::drop: vkDeviceWaitIdle returned {:?}", e);
            }
            self.device.destroy_device(None);
        }
        tracing::debug!("VulkanDevice: logical device destroyed");
    }
}

impl ComputeDevice for VulkanDevice {
    fn memory_table(&self) -> &MemoryTable {
        &self.memory_table
    }

    fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn address_source(&self) -> Option<AddressSource> {
        Some(self.address.source())
    }

    fn max_workgroup_count_x(&self) -> u32 {
        self.capabilities.max_workgroup_count_x
    }

    fn create_buffer(&self, desc: &BufferDesc) -> DeviceResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }.call("vkCreateBuffer")
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, desc: &MemoryDesc) -> DeviceResult<vk::DeviceMemory> {
        let mut flags =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(desc.size)
            .memory_type_index(desc.memory_type_index);
        // The EXT path has no allocation flag; any memory can back an address.
        if desc.device_address && self.address.source() != AddressSource::Ext {
            info = info.push_next(&mut flags);
        }
        unsafe { self.device.allocate_memory(&info, None) }.call("vkAllocateMemory")
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> DeviceResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
            .call("vkBindBufferMemory")
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> DeviceResult<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .call("vkMapMemory")?;
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| DeviceError::new("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceResult<vk::DeviceAddress> {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        let address = match &self.address {
            AddressFns::Core => unsafe { self.device.get_buffer_device_address(&info) },
            AddressFns::Khr(fns) => unsafe { fns.get_buffer_device_address(&info) },
            AddressFns::Ext(fns) => unsafe { fns.get_buffer_device_address(&info) },
        };
        if address == 0 {
            return Err(DeviceError::new(
                self.address.source().entry_point(),
                vk::Result::ERROR_INVALID_DEVICE_ADDRESS_EXT,
            ));
        }
        Ok(address)
    }

    fn create_shader_module(&self, code: &[u32]) -> DeviceResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }.call("vkCreateShaderModule")
    }

    fn create_storage_set_layout(&self) -> DeviceResult<vk::DescriptorSetLayout> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)];
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .call("vkCreateDescriptorSetLayout")
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        unsafe { self.device.create_pipeline_layout(&info, None) }.call("vkCreatePipelineLayout")
    }

    fn create_compute_pipeline(&self, stage: &ComputeStageDesc<'_>) -> DeviceResult<vk::Pipeline> {
        let map_entries = [vk::SpecializationMapEntry::default()
            .constant_id(0)
            .offset(0)
            .size(std::mem::size_of::<u32>())];
        let data = bytemuck::bytes_of(&stage.element_count);
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(data);
        let shader_stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(stage.module)
            .name(stage.entry_point)
            .specialization_info(&specialization);
        let infos = [vk::ComputePipelineCreateInfo::default()
            .stage(shader_stage)
            .layout(stage.layout)];

        match unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &infos, None)
        } {
            Ok(pipelines) => pipelines.into_iter().next().ok_or_else(|| {
                DeviceError::new("vkCreateComputePipelines", vk::Result::ERROR_UNKNOWN)
            }),
            Err((partial, result)) => {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    unsafe { self.device.destroy_pipeline(pipeline, None) };
                }
                Err(DeviceError::new("vkCreateComputePipelines", result))
            }
        }
    }

    fn create_descriptor_pool(&self) -> DeviceResult<vk::DescriptorPool> {
        let sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)];
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }.call("vkCreateDescriptorPool")
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DeviceResult<vk::DescriptorSet> {
        let set_layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .call("vkAllocateDescriptorSets")?;
        sets.into_iter()
            .next()
            .ok_or_else(|| DeviceError::new("vkAllocateDescriptorSets", vk::Result::ERROR_UNKNOWN))
    }

    fn write_storage_descriptor(
        &self,
        set: vk::DescriptorSet,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_infos = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(range)];
        let writes = [vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_infos)];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) }
    }

    fn create_command_pool(&self) -> DeviceResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default().queue_family_index(self.queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }.call("vkCreateCommandPool")
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DeviceResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .call("vkAllocateCommandBuffers")?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::new("vkAllocateCommandBuffers", vk::Result::ERROR_UNKNOWN))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }.call("vkBeginCommandBuffer")
    }

    fn record(&self, cmd: vk::CommandBuffer, op: &GpuOp) {
        unsafe {
            match op {
                GpuOp::CopyBuffer { src, dst, region } => {
                    self.device
                        .cmd_copy_buffer(cmd, *src, *dst, &[region.to_vk()]);
                }
                GpuOp::Barrier {
                    src_stage,
                    dst_stage,
                    buffers,
                } => {
                    let barriers: Vec<_> = buffers.iter().map(|b| b.to_vk()).collect();
                    self.device.cmd_pipeline_barrier(
                        cmd,
                        *src_stage,
                        *dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &barriers,
                        &[],
                    );
                }
                GpuOp::BindComputePipeline { pipeline } => {
                    self.device
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, *pipeline);
                }
                GpuOp::BindDescriptorSet { layout, set } => {
                    self.device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        *layout,
                        0,
                        &[*set],
                        &[],
                    );
                }
                GpuOp::Dispatch {
                    groups_x,
                    groups_y,
                    groups_z,
                } => {
                    self.device
                        .cmd_dispatch(cmd, *groups_x, *groups_y, *groups_z);
                }
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.call("vkEndCommandBuffer")
    }

    fn create_fence(&self) -> DeviceResult<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&info, None) }.call("vkCreateFence")
    }

    fn queue_submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> DeviceResult<()> {
        let command_buffers = [cmd];
        let submits = [vk::SubmitInfo::default().command_buffers(&command_buffers)];
        unsafe { self.device.queue_submit(self.queue, &submits, fence) }.call("vkQueueSubmit")
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> DeviceResult<bool> {
        // u64::MAX means wait forever
        let timeout_ns = u64::try_from(timeout.as_nanos())
            .unwrap_or(u64::MAX)
            .min(u64::MAX - 1);
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(DeviceError::new("vkWaitForFences", result)),
        }
    }

    fn wait_idle(&self) -> DeviceResult<()> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }

    fn destroy(&self, object: DeviceObject) {
        unsafe {
            match object {
                DeviceObject::Buffer(h) => self.device.destroy_buffer(h, None),
                DeviceObject::Memory(h) => self.device.free_memory(h, None),
                DeviceObject::ShaderModule(h) => self.device.destroy_shader_module(h, None),
                DeviceObject::DescriptorSetLayout(h) => {
                    self.device.destroy_descriptor_set_layout(h, None)
                }
                DeviceObject::PipelineLayout(h) => self.device.destroy_pipeline_layout(h, None),
                DeviceObject::Pipeline(h) => self.device.destroy_pipeline(h, None),
                DeviceObject::DescriptorPool(h) => self.device.destroy_descriptor_pool(h, None),
                DeviceObject::CommandPool(h) => self.device.destroy_command_pool(h, None),
                DeviceObject::Fence(h) => self.device.destroy_fence(h, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> DeviceCapabilities {
        DeviceCapabilities {
            buffer_device_address: true,
            capture_replay: false,
            multi_device: false,
            shader_int64: true,
            max_compute_invocations: 1024,
            max_workgroup_size_x: 1024,
            max_workgroup_count_x: 65_535,
        }
    }

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_capability_check_passes() {
        assert!(capable().check().is_ok());
    }

    #[test]
    fn test_missing_device_address_feature_is_fatal() {
        let caps = DeviceCapabilities {
            buffer_device_address: false,
            ..capable()
        };
        let err = caps.check().unwrap_err();
        assert!(matches!(
            err,
            ForgeError::CapabilityMissing(ref what) if what.contains("bufferDeviceAddress")
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_small_workgroup_limit_is_rejected() {
        let caps = DeviceCapabilities {
            max_compute_invocations: 256,
            ..capable()
        };
        assert!(matches!(
            caps.check(),
            Err(ForgeError::CapabilityMissing(_))
        ));
    }

    #[test]
    fn test_queue_family_selection() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 0),
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        assert_eq!(select_queue_family(&families), Some(3));
        assert_eq!(select_queue_family(&families[..3]), None);
    }
}
