//! Common test utilities
//!
//! Shared helpers for the integration tests:
//! - SPIR-V stubs and shader files for the software device
//! - Teardown assertions against the software device's bookkeeping
//! - A Vulkan availability fixture for `gpu-tests` runs
//!
//! Tests that touch a real device run serially and skip when no Vulkan
//! device is present.

#![allow(dead_code)]

mod fixtures;

pub use fixtures::*;
pub use serial_test::serial;

#[cfg(feature = "gpu-tests")]
pub use gpu::*;

#[cfg(feature = "gpu-tests")]
mod gpu {
    use bdaforge::backend::{list_physical_devices, PhysicalDeviceInfo};
    use bdaforge::config::EnumerationLimits;
    use once_cell::sync::Lazy;

    /// Global Vulkan fixture
    ///
    /// Initialized once for all tests. `None` when no loader or device is
    /// available, in which case GPU tests return early.
    pub static GPU_FIXTURE: Lazy<Option<GpuTestFixture>> = Lazy::new(|| {
        match list_physical_devices(&EnumerationLimits::default()) {
            Ok(devices) if !devices.is_empty() => {
                eprintln!("GPU test fixture: {} Vulkan device(s)", devices.len());
                for device in &devices {
                    eprintln!("   {}", device);
                }
                Some(GpuTestFixture { devices })
            }
            Ok(_) => {
                eprintln!("WARNING: no Vulkan device found - skipping GPU tests");
                None
            }
            Err(e) => {
                eprintln!("WARNING: Vulkan unavailable ({}) - skipping GPU tests", e);
                None
            }
        }
    });

    pub struct GpuTestFixture {
        devices: Vec<PhysicalDeviceInfo>,
    }

    impl GpuTestFixture {
        pub fn devices(&self) -> &[PhysicalDeviceInfo] {
            &self.devices
        }

        pub fn device_name(&self) -> &str {
            &self.devices[0].name
        }
    }
}
