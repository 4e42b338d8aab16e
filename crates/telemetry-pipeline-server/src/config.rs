// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use telemetry_pipeline::constants::{DEFAULT_BUFFER_CAPACITY, DEFAULT_RETENTION_SECS};
use telemetry_pipeline::labels::LabelSet;
use telemetry_pipeline::pipeline::PipelineConfig;
use telemetry_pipeline::util::parse_metric_namespace;

use crate::error::ServerError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 8001;
const DEFAULT_STATSD_PORT: u16 = 8125;
const DEFAULT_COMPACTION_INTERVAL_SECS: u64 = 60;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1_024 * 1_024;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the pipeline server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP and statsd listeners bind to
    pub host: String,
    /// HTTP port; 0 picks a free port
    pub http_port: u16,
    /// Statsd UDP port; 0 picks a free port
    pub statsd_port: u16,
    /// Whether to start the statsd listener
    pub use_statsd: bool,
    /// Optional prefix of statsd metric names
    pub metric_namespace: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub buffer_capacity: usize,
    pub retention: Duration,
    pub compaction_interval: Duration,
    /// Budget of a single query or scrape
    pub query_timeout: Duration,
    /// Largest accepted request body
    pub max_request_bytes: usize,
    /// Labels attached to every ingested event
    pub base_labels: LabelSet,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            statsd_port: DEFAULT_STATSD_PORT,
            use_statsd: true,
            metric_namespace: None,
            log_level: "info".to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            compaction_interval: Duration::from_secs(DEFAULT_COMPACTION_INTERVAL_SECS),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            base_labels: LabelSet::default(),
        }
    }
}

impl ServerConfig {
    /// Create configuration from `PIPELINE_*` environment variables
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with variables read through `lookup`. Unparseable
    /// numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let base_labels = match lookup("PIPELINE_LABELS") {
            Some(tags) => LabelSet::parse(&tags).map_err(|e| {
                ServerError::InvalidConfig(format!("Invalid PIPELINE_LABELS: {e}"))
            })?,
            None => LabelSet::default(),
        };

        let config = Self {
            host: lookup("PIPELINE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            http_port: parsed(lookup("PIPELINE_HTTP_PORT"), DEFAULT_HTTP_PORT),
            statsd_port: parsed(lookup("PIPELINE_STATSD_PORT"), DEFAULT_STATSD_PORT),
            use_statsd: lookup("PIPELINE_USE_STATSD")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(true),
            metric_namespace: lookup("PIPELINE_METRIC_NAMESPACE")
                .and_then(|val| parse_metric_namespace(&val)),
            log_level: lookup("PIPELINE_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),
            buffer_capacity: parsed(lookup("PIPELINE_BUFFER_CAPACITY"), DEFAULT_BUFFER_CAPACITY),
            retention: Duration::from_secs(parsed(
                lookup("PIPELINE_RETENTION_SECS"),
                DEFAULT_RETENTION_SECS,
            )),
            compaction_interval: Duration::from_secs(parsed(
                lookup("PIPELINE_COMPACTION_INTERVAL_SECS"),
                DEFAULT_COMPACTION_INTERVAL_SECS,
            )),
            query_timeout: Duration::from_millis(parsed(
                lookup("PIPELINE_QUERY_TIMEOUT_MS"),
                DEFAULT_QUERY_TIMEOUT_MS,
            )),
            max_request_bytes: parsed(
                lookup("PIPELINE_MAX_REQUEST_BYTES"),
                DEFAULT_MAX_REQUEST_BYTES,
            ),
            base_labels,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.host.trim().is_empty() {
            return Err(ServerError::InvalidConfig(
                "PIPELINE_HOST cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ServerError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.compaction_interval.is_zero() {
            return Err(ServerError::InvalidConfig(
                "Compaction interval must be greater than 0".to_string(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "Query timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(ServerError::InvalidConfig(
                "Max request size must be greater than 0".to_string(),
            ));
        }

        self.pipeline_config().validate()?;
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_capacity: self.buffer_capacity,
            retention: self.retention,
            base_labels: self.base_labels.clone(),
            ..Default::default()
        }
    }
}
