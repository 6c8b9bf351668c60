// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing output for runlog.
//!
//! ```text
//! RUNLOG | LEVEL | [span{fields}:] message fields
//! RUNLOG | WARN | metrics publisher failed to send 12 item(s), retry 1/2 in 1000ms: ...
//! RUNLOG | ERROR | Run abc123 was cancelled remotely, exiting critical=true
//! ```
//!
//! [`init`] also wires in the [`RunSinks`] of the process. A run attaches its
//! `runlog.log` file there for as long as it lives, and in debug mode its
//! console, which ships the SDK's own warnings and errors on the messages
//! stream. Callers that install their own subscriber can add
//! [`RunSinks::file_layer`] and [`RunSinks::forward_layer`] themselves.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::field::{Field, Visit};
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields, MakeWriter,
};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;
use crate::console::{Console, ConsoleLevel};

/// SDK diagnostics file inside a run directory.
pub const LOG_FILE: &str = "runlog.log";
/// Console lines file inside a run directory.
pub const SYS_LOG_FILE: &str = "sys.log";

const TARGET_PREFIX: &str = "runlog";
const CONSOLE_TARGET: &str = "runlog::console";
const MESSAGES_STREAM: &str = "messages";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "RUNLOG | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter for `level`, with the HTTP stack silenced.
#[must_use]
pub fn env_filter(level: LogLevel) -> EnvFilter {
    let directives = format!("h2=off,hyper=off,rustls=off,{}", level.as_directive());
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Installs the global subscriber. Returns false if one is already set.
pub fn init(level: LogLevel) -> bool {
    let sinks = run_sinks();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(Formatter)
                .with_filter(env_filter(level)),
        )
        .with(sinks.file_layer().with_filter(env_filter(level)))
        .with(sinks.forward_layer().with_filter(LevelFilter::WARN));

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Registry {
    next: u64,
    files: Vec<(u64, Arc<Mutex<File>>)>,
    consoles: Vec<(u64, Console)>,
}

/// Per-run destinations of the SDK's own events.
#[derive(Clone, Default)]
pub struct RunSinks {
    registry: Arc<Mutex<Registry>>,
}

/// The sinks [`init`] installs.
pub fn run_sinks() -> &'static RunSinks {
    static SINKS: OnceLock<RunSinks> = OnceLock::new();
    SINKS.get_or_init(RunSinks::default)
}

impl RunSinks {
    /// Appends formatted events to `path` until the guard is dropped.
    pub fn attach_file(&self, path: &Path) -> io::Result<SinkGuard> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut registry = lock(&self.registry);
        registry.next += 1;
        let id = registry.next;
        registry.files.push((id, Arc::new(Mutex::new(file))));
        Ok(self.guard(id))
    }

    /// Ships WARN and above on `console` until the guard is dropped.
    #[must_use]
    pub fn attach_messages(&self, console: Console) -> SinkGuard {
        let mut registry = lock(&self.registry);
        registry.next += 1;
        let id = registry.next;
        registry.consoles.push((id, console));
        self.guard(id)
    }

    fn guard(&self, id: u64) -> SinkGuard {
        SinkGuard {
            sinks: self.clone(),
            id,
        }
    }

    fn consoles(&self) -> Vec<Console> {
        lock(&self.registry)
            .consoles
            .iter()
            .map(|(_, console)| console.clone())
            .collect()
    }

    /// Writes full-format events into every attached file.
    #[must_use]
    pub fn file_layer<S>(
        &self,
    ) -> tracing_subscriber::fmt::Layer<S, format::DefaultFields, format::Format, Self>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_writer(self.clone())
    }

    /// Ships `runlog` events to every attached console.
    #[must_use]
    pub fn forward_layer(&self) -> ForwardLayer {
        ForwardLayer {
            sinks: self.clone(),
        }
    }
}

/// Detaches its sink when dropped.
pub struct SinkGuard {
    sinks: RunSinks,
    id: u64,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let mut registry = lock(&self.sinks.registry);
        registry.files.retain(|(id, _)| *id != self.id);
        registry.consoles.retain(|(id, _)| *id != self.id);
    }
}

impl<'a> MakeWriter<'a> for RunSinks {
    type Writer = RunFiles;

    fn make_writer(&'a self) -> Self::Writer {
        RunFiles(
            lock(&self.registry)
                .files
                .iter()
                .map(|(_, file)| Arc::clone(file))
                .collect(),
        )
    }
}

/// Fans one formatted event out to the attached files.
pub struct RunFiles(Vec<Arc<Mutex<File>>>);

impl Write for RunFiles {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for file in &self.0 {
            lock(file).write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for file in &self.0 {
            lock(file).flush()?;
        }
        Ok(())
    }
}

/// Forwards `runlog` warnings and errors to the attached consoles.
///
/// Console lines are skipped since the console ships them itself, and so are
/// failures of the messages stream, which would otherwise feed themselves.
pub struct ForwardLayer {
    sinks: RunSinks,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if *metadata.level() > Level::WARN
            || !target.starts_with(TARGET_PREFIX)
            || target.starts_with(CONSOLE_TARGET)
        {
            return;
        }
        let consoles = self.sinks.consoles();
        if consoles.is_empty() {
            return;
        }

        let mut line = Line::default();
        event.record(&mut line);
        if line.stream.as_deref() == Some(MESSAGES_STREAM) {
            return;
        }
        let level = match (*metadata.level(), line.critical) {
            (Level::ERROR, true) => ConsoleLevel::Critical,
            (Level::ERROR, false) => ConsoleLevel::Error,
            _ => ConsoleLevel::Warning,
        };
        let text = line.text();
        for console in consoles {
            console.forward(level, &text);
        }
    }
}

#[derive(Default)]
struct Line {
    message: String,
    fields: Vec<String>,
    critical: bool,
    stream: Option<String>,
}

impl Line {
    fn text(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        format!("{} {}", self.message, self.fields.join(" "))
    }
}

impl Visit for Line {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "stream" => self.stream = Some(value.to_string()),
            name => self.fields.push(format!("{name}={value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            name => self.fields.push(format!("{name}={value:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(level: LogLevel, emit: impl FnOnce()) -> String {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter(level))
            .with_writer(move || writer.clone())
            .event_format(Formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_prefix_and_level() {
        let output = capture(LogLevel::Warn, || {
            tracing::warn!("queue is backing up");
            tracing::info!("filtered out");
        });
        assert_eq!(output, "RUNLOG | WARN | queue is backing up\n");
    }

    fn messages() -> crate::publisher::Publisher {
        let settings = crate::config::Settings::default();
        let transport = crate::transport::Transport::new(&settings, Some("r1"), "run").unwrap();
        crate::publisher::Publisher::new(
            "messages",
            "http://127.0.0.1:9/ingest/logs".to_string(),
            transport,
            &settings,
            &tokio_util::sync::CancellationToken::new(),
        )
    }

    fn shipped(publisher: &crate::publisher::Publisher) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| publisher.queue().pop())
            .map(|payload| serde_json::from_slice(&payload).unwrap())
            .collect()
    }

    #[test]
    fn test_forward_layer_ships_sdk_warnings() {
        let sinks = RunSinks::default();
        let publisher = messages();
        let guard = sinks.attach_messages(Console::new(Some(publisher.clone()), true));
        let subscriber = tracing_subscriber::registry().with(sinks.forward_layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(
                target: "runlog::publisher",
                stream = "metrics",
                attempt = 1,
                "metrics publisher failed"
            );
            tracing::error!(target: "runlog::uploader", critical = true, "no upload url");
            tracing::info!(target: "runlog::publisher", "sent 3 item(s)");
            tracing::warn!(target: "runlog::console", "already shipped by the console");
            tracing::warn!(
                target: "runlog::publisher",
                stream = "messages",
                "messages publisher failed"
            );
            tracing::warn!(target: "hyper", "not ours");
        });

        let lines = shipped(&publisher);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["logType"], "WARNING");
        assert_eq!(lines[0]["message"], "metrics publisher failed attempt=1");
        assert_eq!(lines[1]["logType"], "CRITICAL");
        assert_eq!(lines[1]["message"], "no upload url");

        drop(guard);
        let subscriber = tracing_subscriber::registry().with(sinks.forward_layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "runlog::publisher", "after detach");
        });
        assert!(publisher.queue().is_empty());
    }

    #[test]
    fn test_file_layer_writes_attached_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        let sinks = RunSinks::default();
        let guard = sinks.attach_file(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(sinks.file_layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("retrying upload");
            drop(guard);
            tracing::warn!("after detach");
        });

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("WARN"));
        assert!(written.contains("retrying upload"));
        assert!(!written.contains("after detach"));
    }

    #[test]
    fn test_critical_field_and_span() {
        let output = capture(LogLevel::Debug, || {
            let span = tracing::debug_span!("publisher", stream = "metrics");
            let _guard = span.enter();
            tracing::error!(critical = true, "dropping batch");
        });
        assert_eq!(
            output,
            "RUNLOG | ERROR | publisher{stream=\"metrics\"}: dropping batch critical=true\n"
        );
    }
}
