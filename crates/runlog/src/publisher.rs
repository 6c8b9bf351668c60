// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching publisher: one background loop per stream.
//!
//! Producers push encoded lines with [`Publisher::enqueue`] and return
//! immediately. The loop wakes every debounce tick, drains the queue into
//! batches of at most `max_batch_items` and POSTs each batch as a single
//! ndjson body. A failed batch goes back to the queue tail and is retried
//! after a backoff until the attempt budget runs out, then it is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::queue::WorkQueue;
use crate::transport::Transport;

/// Pops up to `max_items` payloads, stopping early once `interval` has
/// elapsed or the queue runs dry.
#[must_use]
pub fn collect_batch(queue: &WorkQueue, max_items: usize, interval: Duration) -> Vec<Bytes> {
    let started = Instant::now();
    let mut batch = Vec::new();
    while batch.len() < max_items && started.elapsed() < interval {
        match queue.pop() {
            Some(payload) => batch.push(payload),
            None => break,
        }
    }
    batch
}

fn join_lines(batch: &[Bytes]) -> Bytes {
    let mut body = BytesMut::with_capacity(batch.iter().map(Bytes::len).sum());
    for payload in batch {
        body.extend_from_slice(payload);
    }
    body.freeze()
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    url: String,
    queue: Arc<WorkQueue>,
    transport: Transport,
    max_batch_items: usize,
    transmit_interval: Duration,
    debounce: Duration,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Publisher {
    /// `parent` cancels this publisher together with its siblings.
    #[must_use]
    pub fn new(
        name: &'static str,
        url: String,
        transport: Transport,
        settings: &Settings,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                url,
                queue: Arc::new(WorkQueue::new()),
                transport,
                max_batch_items: settings.max_batch_items.max(1),
                transmit_interval: settings.transmit_interval,
                debounce: settings.debounce,
                stop: parent.child_token(),
                task: Mutex::new(None),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.inner.queue
    }

    pub fn enqueue(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        if self.inner.stop.is_cancelled() && self.is_finished() {
            debug!("{} publisher stopped, dropping payload", self.inner.name);
            return;
        }
        self.inner.queue.push(payload);
    }

    /// Payloads delivered with a 2xx response.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Payloads given up on after the retry budget was spent.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn is_finished(&self) -> bool {
        let task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Spawns the loop on `handle`. A second call is a no-op.
    pub fn start(&self, handle: &Handle) {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let publisher = self.clone();
        *task = Some(handle.spawn(async move { publisher.run().await }));
    }

    /// Asks the loop to drain what is queued and exit.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    pub async fn join(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("{} publisher task failed: {}", self.inner.name, e);
            }
        }
    }

    async fn run(&self) {
        debug!("{} publisher started", self.inner.name);
        loop {
            if !self.inner.queue.is_empty() {
                self.flush().await;
            }
            if self.inner.stop.is_cancelled() {
                if self.inner.queue.is_empty() {
                    break;
                }
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.inner.debounce) => {}
                () = self.inner.stop.cancelled() => {}
            }
        }
        debug!(
            "{} publisher stopped, delivered={} dropped={}",
            self.inner.name,
            self.delivered(),
            self.dropped()
        );
    }

    /// Sends everything currently queued. Returns once the queue is empty.
    pub async fn flush(&self) {
        let inner = &self.inner;
        let policy = inner.transport.policy();
        let mut attempt = 0;

        loop {
            let batch = collect_batch(&inner.queue, inner.max_batch_items, inner.transmit_interval);
            if batch.is_empty() {
                return;
            }
            let count = batch.len() as u64;
            let req = inner.transport.post_ndjson(&inner.url, join_lines(&batch));

            match Transport::send_once(req).await {
                Ok(_) => {
                    attempt = 0;
                    inner.delivered.fetch_add(count, Ordering::Relaxed);
                    debug!("{} publisher sent {} item(s)", inner.name, count);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt < policy.max_attempts {
                        let wait = policy.backoff(attempt);
                        warn!(
                            stream = inner.name,
                            "{} publisher failed to send {} item(s), retry {}/{} in {}ms: {}",
                            inner.name,
                            count,
                            attempt,
                            policy.max_attempts,
                            wait.as_millis(),
                            e
                        );
                        inner.queue.requeue(batch);
                        tokio::time::sleep(wait).await;
                    } else {
                        error!(
                            critical = true,
                            stream = inner.name,
                            "{} publisher dropping {} item(s) after {} attempt(s): {}",
                            inner.name,
                            count,
                            attempt,
                            e
                        );
                        inner.dropped.fetch_add(count, Ordering::Relaxed);
                        attempt = 0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn settings(retry_max: u32) -> Settings {
        Settings {
            retry_max,
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(2),
            debounce: Duration::from_millis(5),
            ..Settings::default()
        }
    }

    fn publisher(url: String, settings: &Settings) -> Publisher {
        let transport = Transport::new(settings, Some("r1"), "run").unwrap();
        Publisher::new("metrics", url, transport, settings, &CancellationToken::new())
    }

    #[test]
    fn test_collect_batch_respects_max_items() {
        let queue = WorkQueue::new();
        for i in 0..5 {
            queue.push(Bytes::from(format!("{i}\n")));
        }
        let batch = collect_batch(&queue, 3, Duration::from_secs(1));
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(join_lines(&batch), Bytes::from_static(b"0\n1\n2\n"));
    }

    #[test]
    fn test_collect_batch_empty_queue() {
        let queue = WorkQueue::new();
        assert!(collect_batch(&queue, 10, Duration::from_secs(1)).is_empty());
    }

    #[tokio::test]
    async fn test_flush_sends_one_batch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest/metrics")
            .match_body(Matcher::Exact("a\nb\n".to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let settings = settings(2);
        let publisher = publisher(format!("{}/ingest/metrics", server.url()), &settings);
        publisher.enqueue(Bytes::from_static(b"a\n"));
        publisher.enqueue(Bytes::from_static(b"b\n"));
        publisher.flush().await;

        mock.assert_async().await;
        assert_eq!(publisher.delivered(), 2);
        assert!(publisher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_flush_drops_after_retry_budget() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest/data")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let settings = settings(3);
        let publisher = publisher(format!("{}/ingest/data", server.url()), &settings);
        publisher.enqueue(Bytes::from_static(b"x\n"));
        publisher.flush().await;

        mock.assert_async().await;
        assert_eq!(publisher.dropped(), 1);
        assert_eq!(publisher.delivered(), 0);
        assert!(publisher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest/logs")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let settings = settings(2);
        let publisher = publisher(format!("{}/ingest/logs", server.url()), &settings);
        publisher.start(&Handle::current());
        for i in 0..10 {
            publisher.enqueue(Bytes::from(format!("{i}\n")));
        }
        publisher.stop();
        publisher.join().await;

        mock.assert_async().await;
        assert_eq!(publisher.delivered(), 10);
        assert!(publisher.queue().is_empty());
    }
}
