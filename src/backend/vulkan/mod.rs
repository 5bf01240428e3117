//! Vulkan backend built on `ash`

pub mod device;
pub mod instance;

pub use device::{select_queue_family, DeviceCapabilities, VulkanDevice};
pub use instance::{
    describe_system, device_type_name, format_version, list_physical_devices, LayerInfo,
    PhysicalDeviceInfo, SystemInfo, VulkanInstance,
};
