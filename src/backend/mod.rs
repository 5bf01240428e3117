//! Device backends

pub mod commands;
pub mod device;
pub mod error;
pub mod software;
pub mod vulkan;

pub use commands::{BufferBarrier, CopyRegion, GpuOp};
pub use device::{
    resolve_address_source, AddressSource, BufferDesc, ComputeDevice, ComputeStageDesc,
    DeviceObject, MemoryDesc,
};
pub use error::{DeviceError, DeviceResult};
pub use software::{Hazard, SoftwareDevice, SoftwareStats};
pub use vulkan::{
    describe_system, list_physical_devices, PhysicalDeviceInfo, SystemInfo, VulkanDevice,
};
