// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-interval loop that samples the host and polls the run trigger.
//!
//! A `CANCELLED` trigger ends the process through the exit hook right away;
//! graceful shutdown is skipped. Every other failure is logged as critical
//! and the loop carries on with the next tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use runlog_sys::SystemSampler;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::api::now;
use crate::classify::StepCounter;
use crate::interface::Interface;

/// Exit code used when the run is cancelled remotely.
pub const CANCELLED_EXIT_CODE: i32 = 2;

pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Terminates the process with the given code.
#[must_use]
pub fn process_exit() -> ExitHook {
    Arc::new(|code: i32| {
        std::process::exit(code);
    })
}

/// Sample keys with the reserved system label in front.
#[must_use]
pub fn prefix_sample(label: &str, sample: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    sample
        .into_iter()
        .map(|(name, value)| (format!("{label}{name}"), value))
        .collect()
}

struct Shared {
    sampler: Arc<dyn SystemSampler>,
    interface: Option<Interface>,
    step: Arc<StepCounter>,
    label: String,
    exit: ExitHook,
}

pub struct SystemMonitor {
    shared: Arc<Shared>,
    interval: Duration,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SystemMonitor {
    #[must_use]
    pub fn new(
        sampler: Arc<dyn SystemSampler>,
        interface: Option<Interface>,
        step: Arc<StepCounter>,
        label: String,
        interval: Duration,
        exit: ExitHook,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sampler,
                interface,
                step,
                label,
                exit,
            }),
            interval,
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Metric names the sampler reports, already prefixed.
    #[must_use]
    pub fn metric_names(&self) -> Vec<String> {
        self.shared
            .sampler
            .metric_names()
            .into_iter()
            .map(|name| format!("{}{name}", self.shared.label))
            .collect()
    }

    pub fn start(&self, handle: &Handle) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let stop = self.stop.clone();
        let interval = self.interval;
        *task = Some(handle.spawn(async move {
            loop {
                shared.tick().await;
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = stop.cancelled() => break,
                }
            }
            debug!("System monitor stopped");
        }));
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("System monitor task failed: {}", e);
            }
        }
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Shared {
    async fn tick(&self) {
        let sample = self.sampler.sample();
        let Some(interface) = &self.interface else {
            return;
        };

        if let Some(sample) = sample {
            let values = prefix_sample(&self.label, sample);
            interface.publish_metrics(&values, now(), self.step.current());
        }

        match interface.poll_trigger().await {
            Ok(trigger) if trigger.is_cancelled() => {
                error!(
                    critical = true,
                    "Run {} was cancelled remotely, exiting",
                    interface.run_id()
                );
                (self.exit)(CANCELLED_EXIT_CODE);
            }
            Ok(trigger) => debug!("Trigger status: {}", trigger.status),
            Err(e) => error!(critical = true, "Failed to poll run trigger: {}", e),
        }
    }
}
