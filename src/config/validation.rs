//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use axum::http::HeaderName;
use regex::Regex;

use crate::config::schema::ServerConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every semantic rule and collect all failures.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let api = &config.api;

    if api.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "api.bind_address",
            format!("'{}' is not a socket address", api.bind_address),
        ));
    }

    if !api.root_path.starts_with('/') || !api.root_path.ends_with('/') {
        errors.push(ValidationError::new(
            "api.root_path",
            "must start and end with '/'",
        ));
    }

    if HeaderName::from_bytes(api.trace_header.as_bytes()).is_err() {
        errors.push(ValidationError::new(
            "api.trace_header",
            format!("'{}' is not a valid header name", api.trace_header),
        ));
    }

    for (field, value) in [
        ("api.timeout_secs", api.timeout_secs),
        ("api.start_timeout_secs", api.start_timeout_secs),
        ("api.stop_timeout_secs", api.stop_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if let Err(message) = api.body_limit_bytes() {
        errors.push(ValidationError::new("api.body_limit", message));
    }

    let download = &config.download_from;
    for (field, pattern) in [
        ("download_from.allow_list", &download.allow_list),
        ("download_from.deny_list", &download.deny_list),
    ] {
        if !pattern.is_empty() {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::new(field, e.to_string()));
            }
        }
    }

    if download.retry_min_wait_ms > download.retry_max_wait_ms {
        errors.push(ValidationError::new(
            "download_from.retry_min_wait_ms",
            "must not exceed retry_max_wait_ms",
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    for (id, value) in &config.modules {
        if !value.is_table() {
            errors.push(ValidationError::new(
                "modules",
                format!("flags for module '{id}' must be a table"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
