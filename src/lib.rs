//! bdaforge - Vulkan compute through buffer device addresses
//!
//! Runs one compute program over a large `u32` array. The program never binds
//! its data buffers; it reads their raw device addresses from a small address
//! table and dereferences them directly. The crate covers memory type
//! selection, resource allocation, address capture, the barrier-ordered
//! command sequence, bounded submission and result verification, with a
//! single teardown path for every outcome.

pub mod backend;
pub mod compute;
pub mod config;
pub mod error;
pub mod logging;

pub use backend::{ComputeDevice, DeviceError, SoftwareDevice, VulkanDevice};
pub use compute::{ComputeRun, RunReport, VerificationReport};
pub use config::{EnumerationLimits, RunConfig};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
