// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::api::{encode_message, now};
use crate::publisher::Publisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl ConsoleLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Debug => "DEBUG",
            ConsoleLevel::Info => "INFO",
            ConsoleLevel::Warning => "WARNING",
            ConsoleLevel::Error => "ERROR",
            ConsoleLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log sink handed to callers of a run.
///
/// Every line becomes a tracing event and, once a run directory exists, a
/// line in its `sys.log`. Lines written through `info`/`warn`/`error`/
/// `critical` are also shipped on the messages stream when `ship_all` is set;
/// captured output is always shipped.
#[derive(Clone)]
pub struct Console {
    messages: Option<Publisher>,
    ship_all: bool,
    line: Arc<AtomicU64>,
    sys_log: Option<Arc<Mutex<File>>>,
}

impl Console {
    #[must_use]
    pub fn new(messages: Option<Publisher>, ship_all: bool) -> Self {
        Self {
            messages,
            ship_all,
            line: Arc::new(AtomicU64::new(0)),
            sys_log: None,
        }
    }

    /// Also appends every line to the file at `path`.
    pub fn with_sys_log(mut self, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sys_log = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    /// A console that only writes tracing events.
    #[must_use]
    pub fn local() -> Self {
        Self::new(None, false)
    }

    pub fn info(&self, message: &str) {
        self.write(ConsoleLevel::Info, message, self.ship_all);
    }

    pub fn warn(&self, message: &str) {
        self.write(ConsoleLevel::Warning, message, self.ship_all);
    }

    pub fn error(&self, message: &str) {
        self.write(ConsoleLevel::Error, message, self.ship_all);
    }

    pub fn critical(&self, message: &str) {
        self.write(ConsoleLevel::Critical, message, self.ship_all);
    }

    /// Ships captured output line by line.
    pub fn capture(&self, level: ConsoleLevel, buf: &str) {
        for line in buf.lines().filter(|l| !l.trim().is_empty()) {
            self.write(level, line, true);
        }
    }

    /// Lines shipped so far.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.line.load(Ordering::Relaxed)
    }

    /// Ships an SDK diagnostic without tracing it again.
    pub(crate) fn forward(&self, level: ConsoleLevel, message: &str) {
        self.ship(level, message);
    }

    fn write(&self, level: ConsoleLevel, message: &str, ship: bool) {
        match level {
            ConsoleLevel::Debug => debug!("{}", message),
            ConsoleLevel::Info => info!("{}", message),
            ConsoleLevel::Warning => warn!("{}", message),
            ConsoleLevel::Error => error!("{}", message),
            ConsoleLevel::Critical => error!(critical = true, "{}", message),
        }
        if let Some(file) = &self.sys_log {
            let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = writeln!(file, "{stamp} | {:<7} | {message}", level.as_str()) {
                debug!("Failed to write sys.log: {}", e);
            }
        }
        if ship {
            self.ship(level, message);
        }
    }

    fn ship(&self, level: ConsoleLevel, message: &str) {
        let Some(messages) = &self.messages else {
            return;
        };
        let line = self.line.fetch_add(1, Ordering::Relaxed) + 1;
        match encode_message(level.as_str(), message, now(), line) {
            Ok(payload) => messages.enqueue(payload),
            Err(e) => debug!("Failed to encode console line: {}", e),
        }
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("ship_all", &self.ship_all)
            .field("lines", &self.lines())
            .finish_non_exhaustive()
    }
}
