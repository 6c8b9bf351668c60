// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! How a run handles `log()` calls.
//!
//! 1. **Noop** - nothing leaves the process; no create-run call, no publishers
//! 2. **Debug** - calls are classified on the caller's task, and console output
//!    is shipped to the messages stream
//! 3. **Perf** - calls are handed to a single background worker so the caller
//!    only pays for a channel send

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Noop,
    Debug,
    #[default]
    Perf,
}

impl Mode {
    /// Returns true if the run talks to the remote service.
    pub const fn uses_network(self) -> bool {
        !matches!(self, Self::Noop)
    }

    /// Returns true if `log()` goes through the background worker.
    pub const fn queues_calls(self) -> bool {
        matches!(self, Self::Perf)
    }

    /// Returns true if console lines are shipped as message records.
    pub const fn ships_console(self) -> bool {
        matches!(self, Self::Debug)
    }

    /// Parse from environment variable string.
    ///
    /// Accepts: "noop", "debug", "perf"
    /// Aliases: "disabled", "off", "sync", "async"
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "noop" | "disabled" | "off" => Some(Self::Noop),
            "debug" | "sync" => Some(Self::Debug),
            "perf" | "async" => Some(Self::Perf),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noop => write!(f, "noop"),
            Self::Debug => write!(f, "debug"),
            Self::Perf => write!(f, "perf"),
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value.as_str().and_then(Mode::from_env_str) {
            Some(mode) => Ok(mode),
            None => {
                error!("Invalid mode {value}, using default {}", Mode::default());
                Ok(Mode::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uses_network() {
        assert!(!Mode::Noop.uses_network());
        assert!(Mode::Debug.uses_network());
        assert!(Mode::Perf.uses_network());
    }

    #[test]
    fn test_queues_calls() {
        assert!(Mode::Perf.queues_calls());
        assert!(!Mode::Debug.queues_calls());
        assert!(!Mode::Noop.queues_calls());
    }

    #[test]
    fn test_from_env_str() {
        assert_eq!(Mode::from_env_str("NOOP"), Some(Mode::Noop));
        assert_eq!(Mode::from_env_str(" debug "), Some(Mode::Debug));
        assert_eq!(Mode::from_env_str("async"), Some(Mode::Perf));
        assert_eq!(Mode::from_env_str("fast"), None);
    }

    #[test]
    fn test_serde() {
        assert_eq!(serde_json::to_value(Mode::Debug).unwrap(), json!("debug"));
        let mode: Mode = serde_json::from_value(json!("Noop")).unwrap();
        assert_eq!(mode, Mode::Noop);
        let mode: Mode = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(mode, Mode::Perf);
    }

    #[test]
    fn test_display() {
        assert_eq!(Mode::Perf.to_string(), "perf");
    }
}
