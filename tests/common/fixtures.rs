//! Fixtures for runs against the software device

use std::io::Write;
use std::path::Path;

use bdaforge::backend::SoftwareDevice;
use bdaforge::config::RunConfig;

/// Smallest word sequence the software device accepts as SPIR-V
pub const SPIRV_STUB: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

/// Write [`SPIRV_STUB`] to `path` as a little-endian binary
pub fn write_spirv_stub(path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for word in SPIRV_STUB {
        file.write_all(&word.to_le_bytes())?;
    }
    file.flush()
}

/// Configuration for a quick software run
pub fn small_config(element_count: u32) -> RunConfig {
    RunConfig::new().with_element_count(element_count)
}

/// Every object released once, in a legal order
///
/// # Panics
///
/// Panics if anything is still alive, was destroyed twice, or was
/// destroyed while still in use.
pub fn assert_clean_teardown(device: &SoftwareDevice) {
    let stats = device.stats();
    assert_eq!(device.live_objects(), 0, "objects left alive: {:?}", stats);
    assert_eq!(stats.double_destroys, 0, "double destroys: {:?}", stats);
    assert_eq!(stats.usage_errors, 0, "usage errors: {:?}", stats);
    assert_eq!(stats.mapped, 0, "memory left mapped: {:?}", stats);
    assert_eq!(stats.objects_created, stats.objects_destroyed);
}
