//! Unified error handling for bdaforge
//!
//! Every pipeline stage returns [`ForgeError`]. Errors are grouped into
//! categories so the run can decide what is fatal:
//! - Capability errors (device cannot run the workload at all)
//! - Resource errors (creation, allocation or binding calls failed)
//! - Submission errors (queue submit rejected, fence wait timed out)
//! - Verification errors (result mismatch, reported but not fatal)
//! - User errors (invalid configuration or shader path)

use std::fmt;
use std::time::Duration;

use ash::vk;

use crate::backend::error::DeviceError;
use crate::compute::submission::SubmissionState;

/// Unified error type for bdaforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Capability Errors ==========
    /// A required feature, extension or entry point is absent
    #[error("Required capability missing: {0}")]
    CapabilityMissing(String),

    /// Neither the core nor an extension buffer address entry point exists
    #[error("Buffer device address query is unsupported on this device")]
    AddressQueryUnsupported,

    // ========== Resource Errors ==========
    /// No memory type satisfies compatibility, properties and capacity
    #[error(
        "No compatible memory type (type bits {type_bits:#b}, required {required:?}, min size {min_size} bytes)"
    )]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        min_size: vk::DeviceSize,
    },

    /// A creation, allocation or binding call failed
    #[error("Failed to create {resource}: {source}")]
    AllocationFailed {
        resource: &'static str,
        #[source]
        source: DeviceError,
    },

    /// The compute program binary could not be loaded
    #[error("Shader load failed: {0}")]
    ShaderLoadFailed(String),

    /// Command buffer begin/end failed
    #[error("Command recording failed: {0}")]
    RecordingFailed(#[source] DeviceError),

    // ========== Submission Errors ==========
    /// The queue rejected the submission
    #[error("Queue submission failed: {0}")]
    SubmitFailed(#[source] DeviceError),

    /// The fence did not signal within the wait budget
    #[error("Fence wait timed out after {timeout:?}")]
    WaitTimedOut { timeout: Duration },

    /// The submission state machine was driven out of order
    #[error("Invalid submission state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: SubmissionState,
        to: SubmissionState,
    },

    // ========== Verification Errors ==========
    /// An element of the downloaded result differs from the expected value
    #[error("Result mismatch at element {index}: observed {observed}, expected {expected}")]
    VerificationMismatch {
        index: usize,
        observed: u32,
        expected: u32,
    },

    // ========== User Errors ==========
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Device Errors ==========
    /// A device call failed outside any resource creation step
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl ForgeError {
    /// Shorthand for wrapping a failed creation call
    pub fn allocation(resource: &'static str) -> impl FnOnce(DeviceError) -> ForgeError {
        move |source| ForgeError::AllocationFailed { resource, source }
    }

    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::CapabilityMissing(_) | ForgeError::AddressQueryUnsupported => {
                ErrorCategory::Capability
            }

            ForgeError::NoCompatibleMemoryType { .. }
            | ForgeError::AllocationFailed { .. }
            | ForgeError::RecordingFailed(_) => ErrorCategory::Resource,

            ForgeError::SubmitFailed(_) | ForgeError::WaitTimedOut { .. } => {
                ErrorCategory::Submission
            }

            ForgeError::VerificationMismatch { .. } => ErrorCategory::Verification,

            ForgeError::InvalidConfiguration(_) | ForgeError::ShaderLoadFailed(_) => {
                ErrorCategory::User
            }

            ForgeError::InvalidStateTransition { .. } | ForgeError::Device(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Fatal errors end the run and jump straight to teardown
    ///
    /// Only a verification mismatch lets the run complete.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Verification)
    }

    /// Numeric status code of the failing device call, if there was one
    pub fn status_code(&self) -> Option<i32> {
        match self {
            ForgeError::AllocationFailed { source, .. } => Some(source.code),
            ForgeError::RecordingFailed(source)
            | ForgeError::SubmitFailed(source)
            | ForgeError::Device(source) => Some(source.code),
            ForgeError::WaitTimedOut { .. } => Some(vk::Result::TIMEOUT.as_raw()),
            _ => None,
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The device cannot run the workload
    Capability,
    /// A resource could not be created or bound
    Resource,
    /// Submission or completion failed
    Submission,
    /// Results were wrong
    Verification,
    /// Invalid input or configuration
    User,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Capability => write!(f, "Capability"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Submission => write!(f, "Submission"),
            ErrorCategory::Verification => write!(f, "Verification"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Result type alias for pipeline operations
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn device_error() -> DeviceError {
        DeviceError::new("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ForgeError::CapabilityMissing("bufferDeviceAddress".to_string()).category(),
            ErrorCategory::Capability
        );
        assert_eq!(
            ForgeError::AddressQueryUnsupported.category(),
            ErrorCategory::Capability
        );
        assert_eq!(
            ForgeError::AllocationFailed {
                resource: "staging memory",
                source: device_error(),
            }
            .category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            ForgeError::WaitTimedOut {
                timeout: Duration::ZERO
            }
            .category(),
            ErrorCategory::Submission
        );
        assert_eq!(
            ForgeError::InvalidConfiguration("zero elements".to_string()).category(),
            ErrorCategory::User
        );
    }

    #[test]
    fn test_only_verification_is_non_fatal() {
        let mismatch = ForgeError::VerificationMismatch {
            index: 3,
            observed: 5,
            expected: 6,
        };
        assert!(!mismatch.is_fatal());
        assert!(ForgeError::AddressQueryUnsupported.is_fatal());
        assert!(ForgeError::SubmitFailed(device_error()).is_fatal());
    }

    #[test]
    fn test_status_code() {
        let err = ForgeError::allocation("working memory")(device_error());
        assert_eq!(err.status_code(), Some(-2));
        assert_eq!(
            ForgeError::WaitTimedOut {
                timeout: Duration::from_millis(1)
            }
            .status_code(),
            Some(2)
        );
        assert_eq!(ForgeError::AddressQueryUnsupported.status_code(), None);
    }

    #[test]
    fn test_error_display() {
        let err = ForgeError::allocation("staging buffer")(DeviceError::new(
            "vkCreateBuffer",
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        ));
        assert_eq!(
            err.to_string(),
            "Failed to create staging buffer: vkCreateBuffer failed with status -1"
        );

        let err = ForgeError::VerificationMismatch {
            index: 7,
            observed: 1,
            expected: 14,
        };
        assert_eq!(
            err.to_string(),
            "Result mismatch at element 7: observed 1, expected 14"
        );
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Capability.to_string(), "Capability");
        assert_eq!(ErrorCategory::Verification.to_string(), "Verification");
    }
}
