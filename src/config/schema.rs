//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the conversion server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API settings (listener, timeouts, limits).
    pub api: ApiConfig,

    /// Remote downloads through the `downloadFrom` form field.
    pub download_from: DownloadFromConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Per-module flags, keyed by module id. Merged over each module's defaults.
    pub modules: toml::Table,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,

    /// Soft timeout for a request, in seconds. The hard timeout adds a fixed margin.
    pub timeout_secs: u64,

    /// Time allowed for modules to become ready, in seconds.
    pub start_timeout_secs: u64,

    /// Time allowed for draining on shutdown, in seconds.
    pub stop_timeout_secs: u64,

    /// Maximum bytes per multipart request, downloads included.
    /// Empty means unlimited. Accepts "5MB", "512KiB", "1048576".
    pub body_limit: String,

    /// Prefix for every route. Must start and end with '/'.
    pub root_path: String,

    /// Header carrying the request trace id.
    pub trace_header: String,

    /// Skip request logs for the health route.
    pub disable_health_check_logging: bool,

    /// Parent directory for per-request working directories.
    /// Defaults to the system temporary directory.
    pub working_dir: Option<PathBuf>,

    /// Wait for in-flight webhook jobs before shutting down.
    pub wait_for_async_jobs: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            timeout_secs: 30,
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            body_limit: String::new(),
            root_path: "/".to_string(),
            trace_header: "Gotenberg-Trace".to_string(),
            disable_health_check_logging: false,
            working_dir: None,
            wait_for_async_jobs: true,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Parsed body limit; `None` when unlimited.
    pub fn body_limit_bytes(&self) -> Result<Option<u64>, String> {
        parse_byte_size(&self.body_limit)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("docserve"))
    }
}

/// `downloadFrom` configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadFromConfig {
    /// Regex a URL must match. Empty allows everything.
    pub allow_list: String,

    /// Regex a URL must not match. Empty denies nothing.
    pub deny_list: String,

    /// Retries after the first attempt.
    pub max_retry: u32,

    /// Minimum backoff between attempts in milliseconds.
    pub retry_min_wait_ms: u64,

    /// Maximum backoff between attempts in milliseconds.
    pub retry_max_wait_ms: u64,

    /// Ignore the `downloadFrom` field entirely.
    pub disable: bool,
}

impl Default for DownloadFromConfig {
    fn default() -> Self {
        Self {
            allow_list: String::new(),
            deny_list: String::new(),
            max_retry: 4,
            retry_min_wait_ms: 1000,
            retry_max_wait_ms: 30_000,
            disable: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Parse a human-readable byte size. Empty input means no limit.
pub fn parse_byte_size(raw: &str) -> Result<Option<u64>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{raw}' is not a valid byte size"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        other => return Err(format!("unknown byte size unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| format!("'{raw}' overflows"))
}
