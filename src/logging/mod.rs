//! Logging configuration and initialization
//!
//! All progress and diagnostic output of a run goes through `tracing`. This
//! module installs the subscriber, in human-readable or JSON form, with an
//! optional JSON file sink.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,bdaforge=trace")
//! - `BDAFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `BDAFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `BDAFORGE_LOG_FILE`: Optional file path for log output (JSON format)

use once_cell::sync::OnceCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "BDAFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "BDAFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "BDAFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Optional JSON file sink
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Read `BDAFORGE_LOG_LEVEL`, `BDAFORGE_LOG_FORMAT` and `BDAFORGE_LOG_FILE`
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        let mut config = Self::new().with_level(level).with_format(format);
        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            config = config.with_log_file(PathBuf::from(file));
        }
        config
    }
}

/// Initialize logging from the environment.
///
/// This function is idempotent; failures to install the subscriber are
/// ignored so a second subscriber (e.g. in tests) never panics.
///
/// ```ignore
/// bdaforge::init_logging_default();
/// tracing::info!("starting run");
/// ```
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Initialize logging with a custom configuration.
///
/// This function is idempotent.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        if let Err(e) = try_init(config) {
            eprintln!("bdaforge: logging disabled: {e}");
        }
    });
}

fn try_init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;
    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(open_log_file(path)?)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false),
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info),
            )
            .try_init(),
    };
    result.map_err(|e| LoggingError::InvalidFilter(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// Tries `RUST_LOG` first, then `BDAFORGE_LOG_LEVEL`, then `default_level`.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }

    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| LogLevel::parse(&s))
        .unwrap_or(default_level);
    Ok(EnvFilter::new(level.as_filter_str()))
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
