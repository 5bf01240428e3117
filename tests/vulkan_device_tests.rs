//! Runs against a real Vulkan device
//!
//! Enabled with `--features gpu-tests`. Each test skips when the fixture
//! finds no device.

#![cfg(feature = "gpu-tests")]

mod common;

use std::time::Duration;

use bdaforge::backend::{ComputeDevice, VulkanDevice};
use bdaforge::compute::ComputeRun;
use bdaforge::config::RunConfig;
use bdaforge::error::ForgeError;
use common::{serial, GPU_FIXTURE};

fn shader_available(config: &RunConfig) -> bool {
    if config.shader_path.exists() {
        return true;
    }
    eprintln!(
        "WARNING: {} not found - skipping (install glslangValidator and rebuild)",
        config.shader_path.display()
    );
    false
}

#[test]
#[serial]
fn test_device_setup() {
    let Some(fixture) = GPU_FIXTURE.as_ref() else {
        return;
    };
    let device = VulkanDevice::new(&RunConfig::new()).unwrap();
    assert_eq!(device.info().name, fixture.device_name());
    assert!(device.address_source().is_some());
    assert!(device.capabilities().buffer_device_address);
    assert!(!device.memory_table().types.is_empty());
}

#[test]
#[serial]
fn test_full_run_on_device() {
    if GPU_FIXTURE.is_none() {
        return;
    }
    let config = RunConfig::new();
    if !shader_available(&config) {
        return;
    }
    let device = VulkanDevice::new(&config).unwrap();
    let report = ComputeRun::new(&device, config).run().unwrap();

    assert!(report.passed(), "{:?}", report.verification);
    assert_eq!(report.verification.leading_sum, 30);
    assert_eq!(report.addresses.len(), 2);
}

#[test]
#[serial]
fn test_out_of_range_device_index() {
    let Some(fixture) = GPU_FIXTURE.as_ref() else {
        return;
    };
    let config = RunConfig::new().with_device_index(fixture.devices().len());
    let err = VulkanDevice::new(&config).err().unwrap();
    assert!(matches!(err, ForgeError::InvalidConfiguration(_)));
}

#[test]
#[serial]
fn test_zero_timeout_on_device() {
    if GPU_FIXTURE.is_none() {
        return;
    }
    let config = RunConfig::new().with_wait_timeout(Duration::ZERO);
    if !shader_available(&config) {
        return;
    }
    let device = VulkanDevice::new(&config).unwrap();
    // A 25 Mi element dispatch cannot finish in zero time.
    match ComputeRun::new(&device, config).run() {
        Err(ForgeError::WaitTimedOut { .. }) => {}
        other => panic!("expected a timeout, got {:?}", other.map(|r| r.passed())),
    }
}
