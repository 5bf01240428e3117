//! Run configuration
//!
//! [`RunConfig`] controls one compute run: how many elements to transform,
//! how long to wait for the device, which compute program to load and which
//! physical device to use. [`EnumerationLimits`] bounds the device setup
//! enumerations.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ForgeError, ForgeResult};

/// Default number of elements: 25 Mi
pub const DEFAULT_ELEMENT_COUNT: u32 = 25 * 1024 * 1024;

/// Largest element count whose doubled index still fits in a `u32`
pub const MAX_ELEMENT_COUNT: u32 = 1 << 30;

/// Longest accepted fence wait
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// SPIR-V compiled by the build script, if a GLSL compiler was available
const BUILT_SHADER: Option<&str> = option_env!("DOUBLE_ELEMENTS_SPV");

const FALLBACK_SHADER: &str = "shaders/double_elements.spv";

/// Upper bounds applied to device setup enumerations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerationLimits {
    pub max_layers: usize,
    pub max_extensions: usize,
    pub max_devices: usize,
    pub max_queue_families: usize,
}

impl Default for EnumerationLimits {
    fn default() -> Self {
        Self {
            max_layers: 64,
            max_extensions: 256,
            max_devices: 8,
            max_queue_families: 8,
        }
    }
}

/// Result of a bounded enumeration
///
/// `truncated` is set when the driver reported more entries than the limit
/// allowed; `items` then holds only the first `limit` of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerated<T> {
    pub items: Vec<T>,
    pub truncated: bool,
}

impl<T> Enumerated<T> {
    /// Clamp `items` to `limit` entries, warning when anything is dropped
    pub fn bounded(mut items: Vec<T>, limit: usize, what: &str) -> Self {
        let reported = items.len();
        let truncated = reported > limit;
        if truncated {
            tracing::warn!(
                what,
                reported,
                limit,
                "{} truncated: driver reported {}, keeping {}",
                what,
                reported,
                limit
            );
            items.truncate(limit);
        }
        Self { items, truncated }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

/// Configuration for one compute run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of `u32` elements transformed by the compute program
    pub element_count: u32,

    /// Budget for the single fence wait
    pub wait_timeout: Duration,

    /// Compiled SPIR-V compute program
    pub shader_path: PathBuf,

    /// Index into the enumerated physical devices
    pub device_index: usize,

    pub limits: EnumerationLimits,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            element_count: DEFAULT_ELEMENT_COUNT,
            wait_timeout: Duration::from_secs(10),
            shader_path: PathBuf::from(BUILT_SHADER.unwrap_or(FALLBACK_SHADER)),
            device_index: 0,
            limits: EnumerationLimits::default(),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element_count(mut self, element_count: u32) -> Self {
        self.element_count = element_count;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_shader_path(mut self, shader_path: impl Into<PathBuf>) -> Self {
        self.shader_path = shader_path.into();
        self
    }

    pub fn with_device_index(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn with_limits(mut self, limits: EnumerationLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Payload size in bytes (`element_count` 32-bit elements)
    pub fn payload_size(&self) -> u64 {
        u64::from(self.element_count) * std::mem::size_of::<u32>() as u64
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.element_count == 0 {
            return Err(ForgeError::InvalidConfiguration(
                "element count must be at least 1".to_string(),
            ));
        }
        if self.element_count > MAX_ELEMENT_COUNT {
            return Err(ForgeError::InvalidConfiguration(format!(
                "element count {} exceeds maximum {}",
                self.element_count, MAX_ELEMENT_COUNT
            )));
        }
        if self.wait_timeout > MAX_WAIT_TIMEOUT {
            return Err(ForgeError::InvalidConfiguration(format!(
                "wait timeout {:?} exceeds maximum {:?}",
                self.wait_timeout, MAX_WAIT_TIMEOUT
            )));
        }
        if self.limits.max_devices == 0 || self.limits.max_queue_families == 0 {
            return Err(ForgeError::InvalidConfiguration(
                "device and queue family limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_default() {
        let config = RunConfig::default();
        assert_eq!(config.element_count, 25 * 1024 * 1024);
        assert_eq!(config.wait_timeout, Duration::from_secs(10));
        assert_eq!(config.device_index, 0);
        assert_eq!(config.limits.max_layers, 64);
        assert_eq!(config.limits.max_extensions, 256);
        assert_eq!(config.limits.max_devices, 8);
        assert_eq!(config.limits.max_queue_families, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new()
            .with_element_count(4096)
            .with_wait_timeout(Duration::from_millis(250))
            .with_shader_path("/tmp/double.spv")
            .with_device_index(1);

        assert_eq!(config.element_count, 4096);
        assert_eq!(config.wait_timeout.as_millis(), 250);
        assert_eq!(config.shader_path, PathBuf::from("/tmp/double.spv"));
        assert_eq!(config.device_index, 1);
        assert_eq!(config.payload_size(), 4096 * 4);
    }

    #[test]
    fn test_validate_rejects_out_of_range_counts() {
        assert!(RunConfig::new().with_element_count(0).validate().is_err());
        assert!(RunConfig::new()
            .with_element_count(MAX_ELEMENT_COUNT)
            .validate()
            .is_ok());
        let err = RunConfig::new()
            .with_element_count(MAX_ELEMENT_COUNT + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_validate_rejects_unbounded_wait() {
        assert!(RunConfig::new()
            .with_wait_timeout(Duration::ZERO)
            .validate()
            .is_ok());
        assert!(RunConfig::new()
            .with_wait_timeout(MAX_WAIT_TIMEOUT + Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_bounded_enumeration_reports_truncation() {
        let all = Enumerated::bounded((0..10).collect::<Vec<u32>>(), 8, "physical devices");
        assert!(all.truncated);
        assert_eq!(all.len(), 8);
        assert_eq!(all.items.last(), Some(&7));

        let fits = Enumerated::bounded(vec!["a", "b"], 8, "layers");
        assert!(!fits.truncated);
        assert_eq!(fits.items, vec!["a", "b"]);
    }
}
