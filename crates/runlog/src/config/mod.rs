// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run settings.
//!
//! [`Settings`] is fixed once a run is built. It is assembled by a
//! [`SettingsBuilder`] that starts from programmatic values, applies each
//! [`SettingsSource`] in order (later sources win), fills in every endpoint
//! that was left empty from the `url_api` / `url_ingest` bases, and validates
//! the result.
//!
//! # Endpoints
//!
//! ```text
//!   url_api ─────┬── /api/runs/create            url_start
//!                ├── /api/runs/status/update     url_stop
//!                ├── /api/runs/logName/add       url_meta
//!                └── /api/runs/trigger           url_trigger
//!
//!   url_ingest ──┬── /ingest/metrics             url_metrics
//!                ├── /ingest/data                url_data
//!                ├── /ingest/logs                url_messages
//!                └── /files                      url_files
//! ```

pub mod env;
pub mod log_level;
pub mod mode;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

pub use log_level::LogLevel;
pub use mode::Mode;

use crate::config::env::EnvSettingsSource;

/// Helper macro to merge Option<String> fields to String fields
#[macro_export]
macro_rules! merge_string {
    ($settings:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $settings.$field.clone_from(value);
        }
    };
}

/// Helper macro to merge Option<T> fields into Option<T> fields when Some
#[macro_export]
macro_rules! merge_option {
    ($settings:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $settings.$field.clone_from(&$source.$field);
        }
    };
}

/// Helper macro to merge Option<T> fields to T fields when Option<T> is Some
#[macro_export]
macro_rules! merge_option_to_value {
    ($settings:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $settings.$field = value.clone();
        }
    };
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to parse settings: {0}")]
    ParseError(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait SettingsSource {
    fn load(&self, settings: &mut Settings) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Settings {
    pub auth: String,
    pub project: String,
    /// Defaults to today's date when unset
    pub run_name: Option<String>,
    /// Only honoured in noop mode; otherwise the server assigns the id
    pub run_id: Option<String>,
    pub mode: Mode,
    pub dir: PathBuf,
    pub namespace: String,
    pub log_level: LogLevel,
    pub disable_store: bool,
    pub disable_iface: bool,
    /// Leave the global tracing subscriber alone; no run log files either
    pub disable_logger: bool,
    pub http_proxy: Option<String>,

    pub url_api: String,
    pub url_ingest: String,
    pub url_view: String,
    pub url_start: String,
    pub url_stop: String,
    pub url_meta: String,
    pub url_trigger: String,
    pub url_metrics: String,
    pub url_data: String,
    pub url_messages: String,
    pub url_files: String,

    pub retry_max: u32,
    pub retry_wait_min: Duration,
    pub retry_wait_max: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_connections: usize,
    pub max_batch_items: usize,
    pub transmit_interval: Duration,
    /// Publisher sleep while its queue is empty
    pub debounce: Duration,
    /// Poll interval of the perf worker and the progress loop
    pub internal_check_process: Duration,
    pub sys_sampling_interval: Duration,
    pub sys_label: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth: String::new(),
            project: "default".to_string(),
            run_name: None,
            run_id: None,
            mode: Mode::default(),
            dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            namespace: ".runlog".to_string(),
            log_level: LogLevel::default(),
            disable_store: true,
            disable_iface: false,
            disable_logger: false,
            http_proxy: None,

            url_api: "http://localhost:5000".to_string(),
            url_ingest: "http://localhost:3000".to_string(),
            url_view: "http://localhost:3000/view".to_string(),
            url_start: String::new(),
            url_stop: String::new(),
            url_meta: String::new(),
            url_trigger: String::new(),
            url_metrics: String::new(),
            url_data: String::new(),
            url_messages: String::new(),
            url_files: String::new(),

            retry_max: 2,
            retry_wait_min: Duration::from_millis(500),
            retry_wait_max: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(4),
            request_timeout: Duration::from_secs(4),
            max_connections: 32,
            max_batch_items: 1 << 18,
            transmit_interval: Duration::from_secs(8),
            debounce: Duration::from_millis(50),
            internal_check_process: Duration::from_secs(1),
            sys_sampling_interval: Duration::from_secs(4),
            sys_label: "_/sys/".to_string(),
        }
    }
}

impl Settings {
    /// Fills every empty endpoint from the api / ingest base URLs.
    pub fn resolve_endpoints(&mut self) {
        let api = self.url_api.trim_end_matches('/').to_string();
        let ingest = self.url_ingest.trim_end_matches('/').to_string();
        let fill = |field: &mut String, base: &str, path: &str| {
            if field.is_empty() {
                *field = format!("{base}{path}");
            }
        };
        fill(&mut self.url_start, &api, "/api/runs/create");
        fill(&mut self.url_stop, &api, "/api/runs/status/update");
        fill(&mut self.url_meta, &api, "/api/runs/logName/add");
        fill(&mut self.url_trigger, &api, "/api/runs/trigger");
        fill(&mut self.url_metrics, &ingest, "/ingest/metrics");
        fill(&mut self.url_data, &ingest, "/ingest/data");
        fill(&mut self.url_messages, &ingest, "/ingest/logs");
        fill(&mut self.url_files, &ingest, "/files");
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project must not be empty".into()));
        }
        if self.retry_max == 0 {
            return Err(ConfigError::Invalid("retry_max must be at least 1".into()));
        }
        if self.retry_wait_min > self.retry_wait_max {
            return Err(ConfigError::Invalid(format!(
                "retry_wait_min ({:?}) exceeds retry_wait_max ({:?})",
                self.retry_wait_min, self.retry_wait_max
            )));
        }
        if self.max_batch_items == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_items must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.mode.uses_network() && self.url_start.is_empty() {
            return Err(ConfigError::Invalid("endpoints are not resolved".into()));
        }
        Ok(())
    }

    /// `<dir>/<namespace>/<project>/<run_name>/<run_id>`
    #[must_use]
    pub fn work_dir(&self, run_name: &str, run_id: &str) -> PathBuf {
        self.dir
            .join(&self.namespace)
            .join(&self.project)
            .join(run_name)
            .join(run_id)
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct SettingsBuilder {
    sources: Vec<Box<dyn SettingsSource>>,
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[allow(clippy::module_name_repetitions)]
impl SettingsBuilder {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            sources: Vec::new(),
            settings,
        }
    }

    #[must_use]
    pub fn add_source(mut self, source: Box<dyn SettingsSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Result<Settings, ConfigError> {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.settings) {
                error!("Failed to load settings: {}", e);
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load settings, using defaults.");
        }

        if self.settings.http_proxy.is_none() {
            if let Ok(proxy) = std::env::var("HTTPS_PROXY") {
                self.settings.http_proxy = Some(proxy);
            }
        }

        if !self.settings.mode.uses_network() {
            self.settings.disable_iface = true;
            self.settings.disable_store = true;
        }

        self.settings.resolve_endpoints();
        self.settings.validate()?;
        Ok(self.settings.clone())
    }
}

/// Defaults overlaid with `RUNLOG_*` environment variables.
pub fn get_settings(settings: Settings) -> Result<Settings, ConfigError> {
    SettingsBuilder::new(settings)
        .add_source(Box::new(EnvSettingsSource))
        .build()
}

/// Where materialized artifacts of a run are copied.
#[must_use]
pub fn files_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("files")
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        other => {
            error!("Expected a string, got {other}, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(Some(b)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => {
                error!("Failed to parse bool from {s}, ignoring");
                Ok(None)
            }
        },
        Value::Number(n) => Ok(n.as_u64().map(|v| v != 0)),
        _ => Ok(None),
    }
}

/// Accepts integers, floats or numeric strings; garbage is logged and ignored.
pub fn deserialize_optional_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed.and_then(|v| T::try_from(v).ok()) {
        Some(v) => Ok(Some(v)),
        None => {
            if !value.is_null() {
                error!("Failed to parse number from {value}, ignoring");
            }
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match u64::try_from(v) {
                Ok(v) => self.visit_u64(v),
                Err(_) => {
                    error!("Failed to parse duration: negative durations are not allowed, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v < 0f64 || !v.is_finite() {
                error!("Failed to parse duration: {v} is not a valid number of seconds, ignoring");
                return Ok(None);
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v.trim().parse::<f64>() {
                Ok(secs) => self.visit_f64(secs),
                Err(_) => {
                    error!("Failed to parse duration from {v}, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}
