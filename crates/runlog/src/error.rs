// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use crate::config::ConfigError;

/// Errors from a single HTTP exchange with the remote service
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response received: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),

    #[error("request body cannot be replayed")]
    NotReplayable,

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

/// Errors while materializing a file into the run's working directory
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors surfaced to callers of a run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid log payload: {0}")]
    Usage(String),

    #[error("failed to create run: {0}")]
    Startup(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("run not started")]
    NotStarted,

    #[error("run already started")]
    AlreadyStarted,

    #[error("run already finished")]
    Finished,

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("interrupted")]
    Interrupted,
}

impl RunError {
    /// Short variant name, reported as the failure type on terminated runs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            RunError::Usage(_) => "Usage",
            RunError::Startup(_) => "Startup",
            RunError::Config(_) => "Config",
            RunError::File(_) => "File",
            RunError::Io(_) => "Io",
            RunError::Encode(_) => "Encode",
            RunError::NotStarted => "NotStarted",
            RunError::AlreadyStarted => "AlreadyStarted",
            RunError::Finished => "Finished",
            RunError::Shutdown(_) => "Shutdown",
            RunError::Interrupted => "Interrupted",
        }
    }
}
