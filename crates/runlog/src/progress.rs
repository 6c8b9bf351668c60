// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub total: u64,
    pub remaining: u64,
    pub completed: u64,
}

/// Counts submitted `log()` calls against everything still pending in the
/// tracked queues and gauges.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Mutex<u64>,
    queues: Vec<Arc<WorkQueue>>,
    gauges: Vec<Arc<AtomicUsize>>,
    interval: Duration,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(
        queues: Vec<Arc<WorkQueue>>,
        gauges: Vec<Arc<AtomicUsize>>,
        interval: Duration,
    ) -> Self {
        Self {
            total: Mutex::new(0),
            queues,
            gauges,
            interval,
        }
    }

    /// Once per `log()` call, however many records it produces.
    pub fn submit(&self) {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        let queued: usize = self.queues.iter().map(|q| q.len()).sum();
        let pending: usize = self.gauges.iter().map(|g| g.load(Ordering::Acquire)).sum();
        (queued + pending) as u64
    }

    #[must_use]
    pub fn snapshot(&self) -> Progress {
        let total = *self.total.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = self.remaining();
        Progress {
            total,
            remaining,
            completed: total.saturating_sub(remaining),
        }
    }

    /// Reports progress until `stop` is cancelled and nothing is pending.
    pub fn spawn(self: &Arc<Self>, handle: &Handle, stop: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        handle.spawn(async move {
            let mut last = Progress::default();
            loop {
                let progress = tracker.snapshot();
                if progress != last {
                    info!(
                        "Progress: {}/{} logged, {} pending",
                        progress.completed, progress.total, progress.remaining
                    );
                    last = progress;
                }
                if stop.is_cancelled() {
                    if progress.remaining == 0 {
                        break;
                    }
                    tokio::time::sleep(tracker.interval).await;
                    continue;
                }
                tokio::select! {
                    () = tokio::time::sleep(tracker.interval) => {}
                    () = stop.cancelled() => {}
                }
            }
            debug!("Progress tracker stopped at {}/{}", last.completed, last.total);
        })
    }
}
