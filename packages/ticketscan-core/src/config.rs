//! Configuration loading.
//!
//! Values come from `~/.config/ticketscan/config.toml` when present, with
//! built-in defaults for anything missing. The validation endpoint can also be
//! overridden through `TICKETSCAN_VALIDATION_URL`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{BindOptions, Constraints, FacingMode, Range};
use crate::session::SessionOptions;

/// Default validation API URL
const DEFAULT_VALIDATION_URL: &str = "http://localhost:3000/api";

/// Default HTTP timeout for validation requests
const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 10;

/// Environment variable name for validation URL override
const ENV_VALIDATION_URL: &str = "TICKETSCAN_VALIDATION_URL";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    capture: Option<CaptureSection>,
    session: Option<SessionSection>,
    validation: Option<ValidationSection>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureSection {
    width: Option<u32>,
    min_width: Option<u32>,
    height: Option<u32>,
    min_height: Option<u32>,
    frame_rate: Option<f64>,
    min_frame_rate: Option<f64>,
    /// "environment" or "user"
    facing: Option<FacingMode>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionSection {
    poll_interval_ms: Option<u64>,
    max_poll_attempts: Option<u32>,
    metadata_timeout_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ValidationSection {
    api_url: Option<String>,
    timeout_secs: Option<u64>,
}

/// Where a configuration value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    /// `TICKETSCAN_VALIDATION_URL`
    Environment,
    File,
}

impl ConfigSource {
    pub fn describe(self) -> &'static str {
        match self {
            ConfigSource::Default => "built-in default",
            ConfigSource::Environment => ENV_VALIDATION_URL,
            ConfigSource::File => "config file",
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationEndpointConfig {
    pub api_url: String,
    pub timeout_secs: u64,
    pub source: ConfigSource,
}

/// Fully resolved runtime configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub constraints: Constraints,
    pub session: SessionOptions,
    pub validation: ValidationEndpointConfig,
    /// Whether capture/session values came from the config file
    pub source: ConfigSource,
}

impl Default for ScanConfig {
    fn default() -> Self {
        resolve(None, None)
    }
}

/// `<config dir>/ticketscan/config.toml`, if a config dir can be found.
pub fn config_file_path() -> Option<PathBuf> {
    let base = dirs::config_dir().or_else(|| dirs::home_dir().map(|home| home.join(".config")))?;
    Some(base.join("ticketscan").join("config.toml"))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    toml::from_str(content).context("Failed to parse config file")
}

/// Read and parse the file at `path`. A missing file is `Ok(None)`.
fn read_config(path: &Path) -> Result<Option<ConfigFile>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let file = parse_config(&content).with_context(|| format!("Invalid config {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(Some(file))
}

/// Load configuration with priority (validation URL):
/// 1. Environment variable (TICKETSCAN_VALIDATION_URL)
/// 2. Config file (~/.config/ticketscan/config.toml)
/// 3. Default values
pub fn load_scan_config() -> ScanConfig {
    let file = match config_file_path().map(|path| read_config(&path)) {
        Some(Ok(file)) => file,
        Some(Err(e)) => {
            tracing::warn!("{:#}; using defaults", e);
            None
        }
        None => None,
    };
    resolve(file, std::env::var(ENV_VALIDATION_URL).ok())
}

/// Parse a config file body and resolve it against the defaults.
pub fn scan_config_from_str(content: &str) -> Result<ScanConfig> {
    Ok(resolve(Some(parse_config(content)?), None))
}

fn clean_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    (!url.is_empty()).then(|| url.to_string())
}

fn resolve(file: Option<ConfigFile>, env_url: Option<String>) -> ScanConfig {
    let source = if file.is_some() {
        ConfigSource::File
    } else {
        ConfigSource::Default
    };
    let file = file.unwrap_or_default();

    let defaults = Constraints::default();
    let capture = file.capture.unwrap_or_default();
    let constraints = Constraints {
        exact_device_id: None,
        facing_mode: capture.facing.or(defaults.facing_mode),
        width: Range::new(
            capture.width.unwrap_or(defaults.width.ideal),
            capture.min_width.unwrap_or(defaults.width.min),
        ),
        height: Range::new(
            capture.height.unwrap_or(defaults.height.ideal),
            capture.min_height.unwrap_or(defaults.height.min),
        ),
        frame_rate: Range::new(
            capture.frame_rate.unwrap_or(defaults.frame_rate.ideal),
            capture.min_frame_rate.unwrap_or(defaults.frame_rate.min),
        ),
    };

    let bind_defaults = BindOptions::default();
    let session_defaults = SessionOptions::default();
    let section = file.session.unwrap_or_default();
    let session = SessionOptions {
        bind: BindOptions {
            poll_interval: section
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(bind_defaults.poll_interval),
            max_poll_attempts: section
                .max_poll_attempts
                .unwrap_or(bind_defaults.max_poll_attempts),
            metadata_timeout: section
                .metadata_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(bind_defaults.metadata_timeout),
        },
        settle_delay: section
            .settle_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(session_defaults.settle_delay),
    };

    let validation = resolve_validation(file.validation.unwrap_or_default(), env_url);

    ScanConfig {
        constraints,
        session,
        validation,
        source,
    }
}

fn resolve_validation(section: ValidationSection, env_url: Option<String>) -> ValidationEndpointConfig {
    let timeout_secs = section.timeout_secs.unwrap_or(DEFAULT_VALIDATION_TIMEOUT_SECS);

    // Priority 1: Environment variable
    if let Some(url) = env_url.as_deref().and_then(clean_url) {
        tracing::info!("Using validation URL from environment variable: {}", url);
        return ValidationEndpointConfig {
            api_url: url,
            timeout_secs,
            source: ConfigSource::Environment,
        };
    }

    // Priority 2: Config file
    if let Some(url) = section.api_url.as_deref().and_then(clean_url) {
        tracing::info!("Using validation URL from config file: {}", url);
        return ValidationEndpointConfig {
            api_url: url,
            timeout_secs,
            source: ConfigSource::File,
        };
    }

    // Priority 3: Default values
    tracing::debug!("Using default validation URL: {}", DEFAULT_VALIDATION_URL);
    ValidationEndpointConfig {
        api_url: DEFAULT_VALIDATION_URL.to_string(),
        timeout_secs,
        source: ConfigSource::Default,
    }
}

/// The config file location as shown to users.
pub fn config_file_display() -> String {
    match config_file_path() {
        Some(path) => path.display().to_string(),
        None => "~/.config/ticketscan/config.toml".to_string(),
    }
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Ticketscan Configuration
# Place this file at: ~/.config/ticketscan/config.toml

[capture]
# Preferred camera when no device is chosen: "environment" or "user"
# facing = "environment"
# width = 1280
# min_width = 640
# height = 720
# min_height = 480
# frame_rate = 30
# min_frame_rate = 15

[session]
# Render surface polling (interval and attempts) and metadata wait
# poll_interval_ms = 300
# max_poll_attempts = 10
# metadata_timeout_ms = 8000
# Pause between releasing one camera and opening the next when switching
# settle_delay_ms = 500

[validation]
# Ticket validation API (overridden by TICKETSCAN_VALIDATION_URL)
# api_url = "http://localhost:3000/api"
# timeout_secs = 10
"#
    .to_string()
}
