//! Device call error types

use ash::vk;
use thiserror::Error;

/// A device call that did not return `VK_SUCCESS`
///
/// `code` is the raw `VkResult` so progress output can print the same numeric
/// status the driver reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{call} failed with status {code}")]
pub struct DeviceError {
    /// Name of the entry point that failed (e.g. `vkAllocateMemory`)
    pub call: &'static str,
    /// Raw `VkResult` value
    pub code: i32,
}

impl DeviceError {
    pub fn new(call: &'static str, result: vk::Result) -> Self {
        Self {
            call,
            code: result.as_raw(),
        }
    }

    /// The status code as an `ash` result
    pub fn result(&self) -> vk::Result {
        vk::Result::from_raw(self.code)
    }

    /// Check if the driver reported the device as lost
    pub fn is_device_lost(&self) -> bool {
        self.result() == vk::Result::ERROR_DEVICE_LOST
    }

    /// Check if the failure was an out-of-memory condition (host or device)
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self.result(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
        )
    }
}

/// Result type for device calls
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Attach the entry-point name to an `ash` result
pub(crate) trait VkResultExt<T> {
    fn call(self, call: &'static str) -> DeviceResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn call(self, call: &'static str) -> DeviceResult<T> {
        self.map_err(|result| DeviceError::new(call, result))
    }
}
