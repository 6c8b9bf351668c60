// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The run controller.
//!
//! ```text
//!   RunBuilder::build ── create-run, work dir, sys.json ──> Init
//!   Run::start ── publishers, monitor, progress, perf worker ──> Running
//!   Run::finish ── monitor → perf queue → store → interface ──> Completed | Failed | Terminated
//! ```
//!
//! Every `log()` call gets its step and timestamp on the caller's side, under
//! the step lock. In `perf` mode the payload is then handed to a single
//! worker that classifies and publishes in FIFO order; otherwise that happens
//! before `log()` returns.
//!
//! `finish()` runs once. Later calls return the final status without sending
//! anything. A shutdown error or a cancelled [`RunBuilder::interrupt`] token
//! turns the run `Terminated` and the status update carries the failure trace
//! instead of the field names. Dropping the last handle of a running run
//! finishes it as completed.
//!
//! A run with a working directory keeps the SDK's diagnostics in `runlog.log`
//! and its console lines in `sys.log` there.

use std::backtrace::Backtrace;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use runlog_sys::{SystemInfo, SystemSampler};
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{now, FailureTrace, Frame, RunStatus, StatusMetadata};
use crate::classify::{classify, MetaEntry, MetaRegistry, StepCounter, METRIC};
use crate::config::{files_dir, Settings};
use crate::console::Console;
use crate::error::RunError;
use crate::file::gen_id;
use crate::interface::{create_run, Interface};
use crate::logger::{self, run_sinks, SinkGuard, LOG_FILE, SYS_LOG_FILE};
use crate::monitor::{process_exit, ExitHook, SystemMonitor};
use crate::progress::{Progress, ProgressTracker};
use crate::store::DataStore;
use crate::value::Payload;

const SYS_FILE: &str = "sys.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Init,
    Running,
    Finished,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Classifies a payload and feeds the sinks. Shared with the perf worker.
struct Recorder {
    work_dir: Option<PathBuf>,
    registry: MetaRegistry,
    store: Option<Arc<dyn DataStore>>,
    interface: Option<Interface>,
}

impl Recorder {
    fn record(&self, payload: Payload, timestamp: f64, step: u64) -> Result<(), RunError> {
        let mut record = classify(payload, self.work_dir.as_deref(), &self.registry)?;
        let new_meta = std::mem::take(&mut record.new_meta);

        if let Some(store) = &self.store {
            store.insert(&record.numeric, &record.data, &record.files, timestamp, step);
        }
        if let Some(interface) = &self.interface {
            interface.publish(&record, timestamp, step);
            interface.register_meta(new_meta);
        }
        Ok(())
    }
}

struct Job {
    payload: Payload,
    timestamp: f64,
    step: u64,
}

pub struct RunBuilder {
    settings: Settings,
    config: Value,
    store: Option<Arc<dyn DataStore>>,
    sampler: Option<Arc<dyn SystemSampler>>,
    exit: Option<ExitHook>,
    interrupt: Option<CancellationToken>,
}

impl RunBuilder {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            config: Value::Object(serde_json::Map::new()),
            store: None,
            sampler: None,
            exit: None,
            interrupt: None,
        }
    }

    /// User config recorded with the run.
    #[must_use]
    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Local sink; ignored when `disable_store` is set.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn SystemSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Called with the exit code on remote cancellation. Defaults to
    /// terminating the process.
    #[must_use]
    pub fn exit_hook(mut self, exit: ExitHook) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Cancelling `token` while `finish()` drains terminates the run instead.
    /// Wire it to the caller's signal handling.
    #[must_use]
    pub fn interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Creates the run remotely and prepares its working directory. Must be
    /// called from within a tokio runtime.
    pub async fn build(self) -> Result<Run, RunError> {
        let mut settings = self.settings;
        settings.resolve_endpoints();
        settings.validate()?;
        if !settings.disable_logger && !logger::init(settings.log_level) {
            debug!("Global tracing subscriber already set, keeping it");
        }

        let handle = Handle::try_current()
            .map_err(|e| RunError::Startup(format!("no tokio runtime: {e}")))?;
        let name = settings
            .run_name
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d").to_string());
        let system = SystemInfo::collect();

        let online = settings.mode.uses_network() && !settings.disable_iface;
        let (id, url, interface) = if online {
            let created = create_run(&settings, &name, &self.config, &system).await?;
            let interface = Interface::new(
                &settings,
                &created.run_id,
                &name,
                created.url.clone(),
                handle.clone(),
            )
            .map_err(|e| RunError::Startup(e.to_string()))?;
            (created.run_id, created.url, Some(interface))
        } else {
            let id = settings.run_id.clone().unwrap_or_else(gen_id);
            let url = format!(
                "{}/{}/{}",
                settings.url_view.trim_end_matches('/'),
                settings.project,
                id
            );
            (id, url, None)
        };

        let work_dir = if settings.mode.uses_network() {
            let dir = settings.work_dir(&name, &id);
            std::fs::create_dir_all(files_dir(&dir))?;
            write_system_info(&dir, &system)?;
            Some(dir)
        } else {
            None
        };

        let store = if settings.disable_store {
            None
        } else {
            self.store
        };
        let step = Arc::new(StepCounter::new());
        let mut console = Console::new(
            interface.as_ref().map(|i| i.messages().clone()),
            settings.mode.ships_console(),
        );
        let mut diagnostics = None;
        if let (Some(dir), false) = (&work_dir, settings.disable_logger) {
            diagnostics = Some(run_sinks().attach_file(&dir.join(LOG_FILE))?);
            console = console.with_sys_log(&dir.join(SYS_LOG_FILE))?;
        }

        let perf_pending = Arc::new(AtomicUsize::new(0));
        let mut queues = Vec::new();
        let mut gauges = vec![Arc::clone(&perf_pending)];
        if let Some(interface) = &interface {
            queues = interface.queues();
            gauges.push(interface.uploads_in_flight());
        }
        let progress = Arc::new(ProgressTracker::new(
            queues,
            gauges,
            settings.internal_check_process,
        ));

        let monitor = SystemMonitor::new(
            self.sampler.unwrap_or_else(runlog_sys::default_sampler),
            interface.clone(),
            Arc::clone(&step),
            settings.sys_label.clone(),
            settings.sys_sampling_interval,
            self.exit.unwrap_or_else(process_exit),
        );

        debug!("Created run {} ({})", id, url);
        Ok(Run::new(RunInner {
            id,
            name,
            url,
            handle,
            recorder: Arc::new(Recorder {
                work_dir,
                registry: MetaRegistry::new(),
                store,
                interface,
            }),
            settings,
            monitor,
            progress,
            progress_stop: CancellationToken::new(),
            progress_task: Mutex::new(None),
            console,
            step,
            lifecycle: Mutex::new(Lifecycle::Init),
            status: Mutex::new(RunStatus::Running),
            perf_tx: Mutex::new(None),
            perf_task: Mutex::new(None),
            perf_pending,
            finishing: tokio::sync::Mutex::new(()),
            interrupt: self.interrupt,
            diagnostics: Mutex::new(diagnostics),
            forwarding: Mutex::new(None),
        }))
    }
}

/// Appends `system` to the run's `sys.json` list.
fn write_system_info(work_dir: &Path, system: &SystemInfo) -> Result<(), RunError> {
    let path = work_dir.join(SYS_FILE);
    let mut entries: Vec<Value> = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Replacing unreadable {}: {}", path.display(), e);
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    entries.push(serde_json::to_value(system)?);
    std::fs::write(&path, serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}

struct RunInner {
    id: String,
    name: String,
    url: String,
    settings: Settings,
    handle: Handle,
    recorder: Arc<Recorder>,
    monitor: SystemMonitor,
    progress: Arc<ProgressTracker>,
    progress_stop: CancellationToken,
    progress_task: Mutex<Option<JoinHandle<()>>>,
    console: Console,
    step: Arc<StepCounter>,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<RunStatus>,
    perf_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    perf_task: Mutex<Option<JoinHandle<()>>>,
    perf_pending: Arc<AtomicUsize>,
    finishing: tokio::sync::Mutex<()>,
    interrupt: Option<CancellationToken>,
    diagnostics: Mutex<Option<SinkGuard>>,
    forwarding: Mutex<Option<SinkGuard>>,
}

impl Drop for RunInner {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Run {} dropped unfinished, cancelling background tasks", self.id);
            if let Some(interface) = &self.recorder.interface {
                interface.cancel();
            }
        }
        self.progress_stop.cancel();
    }
}

impl RunInner {
    fn is_running(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Running
    }

    async fn finish(&self, code: Option<i32>) -> RunStatus {
        let _finishing = self.finishing.lock().await;
        if *lock(&self.lifecycle) == Lifecycle::Finished {
            return *lock(&self.status);
        }

        let requested = code.map_or(RunStatus::Completed, RunStatus::from_code);
        let interrupted = async {
            match &self.interrupt {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let result = tokio::select! {
            biased;
            () = interrupted => Err(RunError::Interrupted),
            result = self.shutdown() => result,
        };

        let (status, metadata) = match result {
            Ok(()) => (
                requested,
                StatusMetadata::Names(self.recorder.registry.names()),
            ),
            Err(e) => {
                error!(critical = true, "Failed to finish run {}: {}", self.id, e);
                self.abort().await;
                (
                    RunStatus::Terminated,
                    StatusMetadata::Failure(failure_trace(&e)),
                )
            }
        };
        *lock(&self.status) = status;
        *lock(&self.lifecycle) = Lifecycle::Finished;

        if let Some(interface) = &self.recorder.interface {
            if let Err(e) = interface.update_status(status, &metadata).await {
                error!("Failed to update status of run {}: {}", self.id, e);
            }
        }
        info!("Finished run {} as {}", self.id, status);
        lock(&self.diagnostics).take();
        status
    }

    /// monitor → perf queue → store → interface → progress
    async fn shutdown(&self) -> Result<(), RunError> {
        self.monitor.stop().await;

        let tx = lock(&self.perf_tx).take();
        drop(tx);
        let task = lock(&self.perf_task).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| RunError::Shutdown(format!("perf worker: {e}")))?;
        }

        if let Some(store) = &self.recorder.store {
            store
                .stop()
                .map_err(|e| RunError::Shutdown(format!("store: {e}")))?;
        }
        lock(&self.forwarding).take();
        if let Some(interface) = &self.recorder.interface {
            interface.stop().await;
        }

        self.progress_stop.cancel();
        let task = lock(&self.progress_task).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| RunError::Shutdown(format!("progress: {e}")))?;
        }
        Ok(())
    }

    /// Stops whatever an unfinished shutdown left behind, without draining.
    async fn abort(&self) {
        self.monitor.stop().await;
        lock(&self.perf_tx).take();
        lock(&self.forwarding).take();
        if let Some(interface) = &self.recorder.interface {
            interface.cancel();
        }
        self.progress_stop.cancel();
    }
}

/// Finishes the run once the last [`Run`] handle is gone.
struct FinishGuard {
    inner: Arc<RunInner>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.inner.is_running() {
            return;
        }
        warn!("Run {} dropped without finish(), finishing it now", self.inner.id);

        let inner = Arc::clone(&self.inner);
        let finish = async move {
            inner.finish(None).await;
        };
        // A current-thread runtime only makes progress inside its own block_on.
        let blocking = self.inner.handle.runtime_flavor() == RuntimeFlavor::MultiThread;
        match Handle::try_current() {
            Err(_) if blocking => {
                self.inner.handle.block_on(finish);
            }
            Ok(current) if blocking && current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.inner.handle.block_on(finish));
            }
            _ => {
                drop(self.inner.handle.spawn(finish));
            }
        }
    }
}

/// Handle to a run. Clones share the same run.
#[derive(Clone)]
pub struct Run {
    inner: Arc<RunInner>,
    _guard: Arc<FinishGuard>,
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Run {
    fn new(inner: RunInner) -> Self {
        let inner = Arc::new(inner);
        Self {
            _guard: Arc::new(FinishGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Where the run can be viewed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// `None` in noop mode.
    #[must_use]
    pub fn work_dir(&self) -> Option<&Path> {
        self.inner.recorder.work_dir.as_deref()
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        *lock(&self.inner.status)
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        self.inner.step.current()
    }

    #[must_use]
    pub fn console(&self) -> &Console {
        &self.inner.console
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        self.inner.progress.snapshot()
    }

    /// Every field name logged so far, system metrics included.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.inner.recorder.registry.names()
    }

    /// Launches the background tasks.
    pub fn start(&self) -> Result<(), RunError> {
        let inner = &self.inner;
        {
            let mut lifecycle = lock(&inner.lifecycle);
            match *lifecycle {
                Lifecycle::Init => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(RunError::AlreadyStarted),
                Lifecycle::Finished => return Err(RunError::Finished),
            }
        }

        if let Some(interface) = &inner.recorder.interface {
            interface.start();
            if inner.settings.mode.ships_console() && !inner.settings.disable_logger {
                *lock(&inner.forwarding) = Some(run_sinks().attach_messages(inner.console.clone()));
            }
            let entries = inner
                .monitor
                .metric_names()
                .into_iter()
                .filter(|name| inner.recorder.registry.register(name))
                .map(|name| MetaEntry {
                    name,
                    log_type: METRIC.to_string(),
                })
                .collect();
            interface.register_meta(entries);
        }
        inner.monitor.start(&inner.handle);
        *lock(&inner.progress_task) =
            Some(inner.progress.spawn(&inner.handle, inner.progress_stop.clone()));

        if inner.settings.mode.queues_calls() {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let recorder = Arc::clone(&inner.recorder);
            let pending = Arc::clone(&inner.perf_pending);
            let task = inner.handle.spawn(async move {
                while let Some(job) = rx.recv().await {
                    if let Err(e) = recorder.record(job.payload, job.timestamp, job.step) {
                        error!("Failed to record step {}: {}", job.step, e);
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("Perf worker stopped");
            });
            *lock(&inner.perf_tx) = Some(tx);
            *lock(&inner.perf_task) = Some(task);
        }

        info!("Started run {}, view at {}", inner.id, inner.url);
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), RunError> {
        match *lock(&self.inner.lifecycle) {
            Lifecycle::Running => Ok(()),
            Lifecycle::Init => Err(RunError::NotStarted),
            Lifecycle::Finished => Err(RunError::Finished),
        }
    }

    /// Logs one payload and returns the step it was recorded at.
    pub fn log(&self, payload: Payload, step: Option<u64>) -> Result<u64, RunError> {
        self.ensure_running()?;
        if payload.names().any(str::is_empty) {
            return Err(RunError::Usage("field names must not be empty".to_string()));
        }

        let inner = &self.inner;
        let timestamp = now();
        let step = inner.step.advance(step);
        inner.progress.submit();

        let tx = lock(&inner.perf_tx).clone();
        match tx {
            Some(tx) => {
                inner.perf_pending.fetch_add(1, Ordering::AcqRel);
                if tx
                    .send(Job {
                        payload,
                        timestamp,
                        step,
                    })
                    .is_err()
                {
                    inner.perf_pending.fetch_sub(1, Ordering::AcqRel);
                    return Err(RunError::Finished);
                }
            }
            None => inner.recorder.record(payload, timestamp, step)?,
        }
        Ok(step)
    }

    /// Logs a JSON object. Anything else is a usage error.
    pub fn log_json(&self, value: Value, step: Option<u64>) -> Result<u64, RunError> {
        self.log(Payload::try_from(value)?, step)
    }

    /// Finishes as completed.
    pub async fn finish(&self) -> RunStatus {
        self.finish_with_code(None).await
    }

    /// Finishes with the status matching a process exit code.
    pub async fn finish_with_code(&self, code: Option<i32>) -> RunStatus {
        self.inner.finish(code).await
    }
}

fn failure_trace(error: &RunError) -> FailureTrace {
    let trace = Backtrace::force_capture().to_string();
    FailureTrace {
        kind: error.kind().to_string(),
        message: error.to_string(),
        frames: parse_backtrace(&trace),
        trace,
    }
}

/// Frames of a rendered `std::backtrace::Backtrace`.
fn parse_backtrace(trace: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in trace.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let mut parts = location.rsplitn(3, ':');
                let _column = parts.next();
                let lineno = parts.next().and_then(|l| l.parse().ok());
                match (parts.next(), lineno) {
                    (Some(file), Some(lineno)) => {
                        frame.filename = Some(file.to_string());
                        frame.lineno = Some(lineno);
                    }
                    _ => frame.filename = Some(location.to_string()),
                }
            }
            continue;
        }
        if let Some((index, name)) = line.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(Frame {
                    filename: None,
                    lineno: None,
                    name: name.to_string(),
                    line: None,
                });
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::mode::Mode;
    use crate::store::MemoryStore;
    use runlog_sys::NullSampler;

    fn noop_settings() -> Settings {
        Settings {
            mode: Mode::Noop,
            run_name: Some("local".to_string()),
            internal_check_process: std::time::Duration::from_millis(5),
            disable_logger: true,
            ..Settings::default()
        }
    }

    async fn noop_run(settings: Settings) -> Run {
        RunBuilder::new(settings)
            .sampler(Arc::new(NullSampler))
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_backtrace() {
        let trace = "   0: runlog::run::failure_trace\n             at ./src/run.rs:412:17\n   1: core::ops::function::FnOnce::call_once\n   2: std::rt::lang_start\n             at /rustc/library/std/src/rt.rs:159:5\n";
        let frames = parse_backtrace(trace);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].name, "runlog::run::failure_trace");
        assert_eq!(frames[0].filename.as_deref(), Some("./src/run.rs"));
        assert_eq!(frames[0].lineno, Some(412));
        assert_eq!(frames[1].filename, None);
        assert_eq!(frames[2].lineno, Some(159));
    }

    #[test]
    fn test_failure_trace_carries_error() {
        let trace = failure_trace(&RunError::Shutdown("store: disk full".to_string()));
        assert_eq!(trace.kind, "Shutdown");
        assert_eq!(trace.message, "shutdown failed: store: disk full");
        assert!(!trace.trace.is_empty());
    }

    #[tokio::test]
    async fn test_noop_run_lifecycle() {
        let run = noop_run(noop_settings()).await;
        assert_eq!(run.id().len(), 8);
        assert!(run.url().ends_with(run.id()));
        assert!(run.work_dir().is_none());

        assert!(matches!(
            run.log(Payload::new().with("loss", 1.0), None),
            Err(RunError::NotStarted)
        ));
        run.start().unwrap();
        assert!(matches!(run.start(), Err(RunError::AlreadyStarted)));

        assert_eq!(run.log(Payload::new().with("loss", 1.0), None).unwrap(), 1);
        assert_eq!(run.log(Payload::new().with("loss", 0.5), Some(10)).unwrap(), 10);
        assert!(matches!(
            run.log_json(serde_json::json!("not an object"), None),
            Err(RunError::Usage(_))
        ));

        assert_eq!(run.finish().await, RunStatus::Completed);
        assert_eq!(run.finish_with_code(Some(1)).await, RunStatus::Completed);
        assert!(matches!(
            run.log(Payload::new().with("loss", 1.0), None),
            Err(RunError::Finished)
        ));
        assert_eq!(run.field_names(), vec!["loss"]);
    }

    #[tokio::test]
    async fn test_exit_code_maps_to_status() {
        let run = noop_run(noop_settings()).await;
        run.start().unwrap();
        assert_eq!(run.finish_with_code(Some(2)).await, RunStatus::Terminated);
        assert_eq!(run.status(), RunStatus::Terminated);
    }

    #[tokio::test]
    async fn test_store_receives_rows() {
        let store = Arc::new(MemoryStore::new());
        let run = RunBuilder::new(Settings {
            disable_store: false,
            ..noop_settings()
        })
        .store(store.clone())
        .sampler(Arc::new(NullSampler))
        .build()
        .await
        .unwrap();
        run.start().unwrap();
        run.log(Payload::new().with("acc", 0.9).with("note", "ok"), Some(3))
            .unwrap();
        run.finish().await;

        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].step, 3);
        assert_eq!(rows[0].numeric["acc"], 0.9);
        assert!(store.is_stopped());
    }

    #[tokio::test]
    async fn test_interrupt_terminates_finish() {
        let interrupt = CancellationToken::new();
        let run = RunBuilder::new(noop_settings())
            .sampler(Arc::new(NullSampler))
            .interrupt(interrupt.clone())
            .build()
            .await
            .unwrap();
        run.start().unwrap();
        run.log(Payload::new().with("loss", 1.0), None).unwrap();

        interrupt.cancel();
        assert_eq!(run.finish().await, RunStatus::Terminated);
        assert_eq!(run.finish().await, RunStatus::Terminated);
        assert!(matches!(
            run.log(Payload::new().with("loss", 1.0), None),
            Err(RunError::Finished)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_last_handle_finishes_run() {
        let store = Arc::new(MemoryStore::new());
        let run = RunBuilder::new(Settings {
            disable_store: false,
            ..noop_settings()
        })
        .store(store.clone())
        .sampler(Arc::new(NullSampler))
        .build()
        .await
        .unwrap();
        run.start().unwrap();
        run.log(Payload::new().with("acc", 0.5), None).unwrap();

        let clone = run.clone();
        drop(run);
        assert!(!store.is_stopped());
        drop(clone);
        assert!(store.is_stopped());
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_on_current_thread_finishes_in_background() {
        let store = Arc::new(MemoryStore::new());
        let run = RunBuilder::new(Settings {
            disable_store: false,
            ..noop_settings()
        })
        .store(store.clone())
        .sampler(Arc::new(NullSampler))
        .build()
        .await
        .unwrap();
        run.start().unwrap();
        drop(run);

        for _ in 0..100 {
            if store.is_stopped() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(store.is_stopped());
    }

    #[test]
    fn test_system_info_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let info = SystemInfo::collect();
        write_system_info(dir.path(), &info).unwrap();
        write_system_info(dir.path(), &info).unwrap();
        let entries: Vec<Value> =
            serde_json::from_slice(&std::fs::read(dir.path().join(SYS_FILE)).unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["pid"], std::process::id());
    }
}
