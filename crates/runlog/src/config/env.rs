// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `RUNLOG_*` environment variables.
//!
//! Every field is optional; only the variables that are present override the
//! settings being built. Durations are given in seconds (`RUNLOG_RETRY_WAIT_MIN=0.25`).

use std::path::PathBuf;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;

use crate::config::{
    deserialize_optional_bool_from_anything, deserialize_optional_duration_from_seconds,
    deserialize_optional_number, deserialize_optional_string, log_level::LogLevel, mode::Mode,
    ConfigError, Settings, SettingsSource,
};
use crate::{merge_option, merge_option_to_value, merge_string};

#[derive(Debug, PartialEq, Deserialize, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvSettings {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub auth: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub project: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub run_name: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub run_id: Option<String>,
    pub mode: Option<Mode>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub dir: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub namespace: Option<String>,
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub disable_store: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub disable_iface: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub disable_logger: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub http_proxy: Option<String>,

    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_api: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_ingest: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_view: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_start: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_stop: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_meta: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_trigger: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_metrics: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_data: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_messages: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub url_files: Option<String>,

    #[serde(deserialize_with = "deserialize_optional_number")]
    pub retry_max: Option<u32>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub retry_wait_min: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub retry_wait_max: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub connect_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub request_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_number")]
    pub max_connections: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_number")]
    pub max_batch_items: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub transmit_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub debounce: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub internal_check_process: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub sys_sampling_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub sys_label: Option<String>,
}

#[allow(clippy::too_many_lines)]
fn merge_settings(settings: &mut Settings, env: &EnvSettings) {
    merge_string!(settings, env, auth);
    merge_string!(settings, env, project);
    merge_option!(settings, env, run_name);
    merge_option!(settings, env, run_id);
    merge_option_to_value!(settings, env, mode);
    if let Some(dir) = &env.dir {
        settings.dir = PathBuf::from(dir);
    }
    merge_string!(settings, env, namespace);
    merge_option_to_value!(settings, env, log_level);
    merge_option_to_value!(settings, env, disable_store);
    merge_option_to_value!(settings, env, disable_iface);
    merge_option_to_value!(settings, env, disable_logger);
    merge_option!(settings, env, http_proxy);

    merge_string!(settings, env, url_api);
    merge_string!(settings, env, url_ingest);
    merge_string!(settings, env, url_view);
    merge_string!(settings, env, url_start);
    merge_string!(settings, env, url_stop);
    merge_string!(settings, env, url_meta);
    merge_string!(settings, env, url_trigger);
    merge_string!(settings, env, url_metrics);
    merge_string!(settings, env, url_data);
    merge_string!(settings, env, url_messages);
    merge_string!(settings, env, url_files);

    merge_option_to_value!(settings, env, retry_max);
    merge_option_to_value!(settings, env, retry_wait_min);
    merge_option_to_value!(settings, env, retry_wait_max);
    merge_option_to_value!(settings, env, connect_timeout);
    merge_option_to_value!(settings, env, request_timeout);
    merge_option_to_value!(settings, env, max_connections);
    merge_option_to_value!(settings, env, max_batch_items);
    merge_option_to_value!(settings, env, transmit_interval);
    merge_option_to_value!(settings, env, debounce);
    merge_option_to_value!(settings, env, internal_check_process);
    merge_option_to_value!(settings, env, sys_sampling_interval);
    merge_string!(settings, env, sys_label);
}

#[derive(Debug, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvSettingsSource;

impl SettingsSource for EnvSettingsSource {
    fn load(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed("RUNLOG_"));

        let env = figment.extract::<EnvSettings>().map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse settings from environment: {e}"))
        })?;
        merge_settings(settings, &env);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{get_settings, SettingsBuilder};

    #[test]
    fn test_env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RUNLOG_PROJECT", "mnist");
            jail.set_env("RUNLOG_AUTH", "12345");
            jail.set_env("RUNLOG_MODE", "DEBUG");
            jail.set_env("RUNLOG_RETRY_MAX", "5");
            jail.set_env("RUNLOG_RETRY_WAIT_MIN", "0.25");
            jail.set_env("RUNLOG_SYS_SAMPLING_INTERVAL", "10");
            jail.set_env("RUNLOG_LOG_LEVEL", "info");

            let settings = get_settings(Settings::default()).expect("valid settings");
            assert_eq!(settings.project, "mnist");
            assert_eq!(settings.auth, "12345");
            assert_eq!(settings.mode, Mode::Debug);
            assert_eq!(settings.retry_max, 5);
            assert_eq!(settings.retry_wait_min, Duration::from_millis(250));
            assert_eq!(settings.sys_sampling_interval, Duration::from_secs(10));
            assert_eq!(settings.log_level, LogLevel::Info);
            Ok(())
        });
    }

    #[test]
    fn test_base_url_drives_endpoints() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RUNLOG_URL_API", "https://api.example.com");
            jail.set_env("RUNLOG_URL_INGEST", "https://ingest.example.com");
            jail.set_env("RUNLOG_URL_FILES", "https://files.example.com/v2");

            let settings = get_settings(Settings::default()).expect("valid settings");
            assert_eq!(settings.url_start, "https://api.example.com/api/runs/create");
            assert_eq!(
                settings.url_metrics,
                "https://ingest.example.com/ingest/metrics"
            );
            assert_eq!(settings.url_files, "https://files.example.com/v2");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RUNLOG_MODE", "turbo");
            jail.set_env("RUNLOG_RETRY_MAX", "many");
            jail.set_env("RUNLOG_TRANSMIT_INTERVAL", "-3");
            jail.set_env("RUNLOG_DISABLE_STORE", "false");
            jail.set_env("RUNLOG_DISABLE_LOGGER", "true");

            let settings = get_settings(Settings::default()).expect("valid settings");
            assert_eq!(settings.mode, Mode::Perf);
            assert_eq!(settings.retry_max, 2);
            assert_eq!(settings.transmit_interval, Duration::from_secs(8));
            assert!(!settings.disable_store);
            assert!(settings.disable_logger);
            Ok(())
        });
    }

    #[test]
    fn test_env_wins_over_programmatic_values() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RUNLOG_PROJECT", "from-env");

            let settings = SettingsBuilder::new(Settings {
                project: "from-code".to_string(),
                run_name: Some("baseline".to_string()),
                ..Settings::default()
            })
            .add_source(Box::new(EnvSettingsSource))
            .build()
            .expect("valid settings");
            assert_eq!(settings.project, "from-env");
            assert_eq!(settings.run_name.as_deref(), Some("baseline"));
            Ok(())
        });
    }
}
