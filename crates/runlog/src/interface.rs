// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network sink of a run: the three stream publishers, the file uploader and
//! the one-off control calls (create-run, meta, trigger, status).

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::api::{
    encode_data, encode_meta, encode_metrics, encode_start, encode_status, encode_trigger,
    CreateRunResponse, RunStatus, StatusMetadata, TriggerResponse,
};
use crate::classify::{Classified, MetaEntry};
use crate::config::Settings;
use crate::error::{RunError, TransportError};
use crate::publisher::Publisher;
use crate::queue::WorkQueue;
use crate::transport::Transport;
use crate::uploader::Uploader;

/// Registers the run with the service. Any failure is a startup error.
pub async fn create_run<S: Serialize>(
    settings: &Settings,
    run_name: &str,
    config: &Value,
    system: &S,
) -> Result<CreateRunResponse, RunError> {
    let transport =
        Transport::new(settings, None, run_name).map_err(|e| RunError::Startup(e.to_string()))?;
    let body = encode_start(run_name, &settings.project, config, system)?;
    let resp = transport
        .send_with_retry(transport.post_json(&settings.url_start, body), "run creation")
        .await
        .map_err(|e| RunError::Startup(e.to_string()))?;
    resp.json::<CreateRunResponse>()
        .await
        .map_err(|e| RunError::Startup(format!("unexpected create-run response: {e}")))
}

#[derive(Clone)]
pub struct Interface {
    inner: Arc<Inner>,
}

struct Inner {
    run_id: String,
    view_url: String,
    url_meta: String,
    url_trigger: String,
    url_stop: String,
    transport: Transport,
    metrics: Publisher,
    data: Publisher,
    messages: Publisher,
    uploader: Uploader,
    tracker: TaskTracker,
    stop: CancellationToken,
    handle: Handle,
}

impl Interface {
    pub fn new(
        settings: &Settings,
        run_id: &str,
        run_name: &str,
        view_url: String,
        handle: Handle,
    ) -> Result<Self, TransportError> {
        let transport = Transport::new(settings, Some(run_id), run_name)?;
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let publisher = |name: &'static str, url: &str| {
            Publisher::new(name, url.to_string(), transport.clone(), settings, &stop)
        };
        let metrics = publisher("metrics", &settings.url_metrics);
        let data = publisher("data", &settings.url_data);
        let messages = publisher("messages", &settings.url_messages);
        let uploader = Uploader::new(
            transport.clone(),
            settings.url_files.clone(),
            tracker.clone(),
            handle.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                run_id: run_id.to_string(),
                view_url,
                url_meta: settings.url_meta.clone(),
                url_trigger: settings.url_trigger.clone(),
                url_stop: settings.url_stop.clone(),
                transport,
                metrics,
                data,
                messages,
                uploader,
                tracker,
                stop,
                handle,
            }),
        })
    }

    pub fn start(&self) {
        let inner = &self.inner;
        for publisher in [&inner.metrics, &inner.data, &inner.messages] {
            publisher.start(&inner.handle);
        }
        debug!("Interface started for run {}", inner.run_id);
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    #[must_use]
    pub fn view_url(&self) -> &str {
        &self.inner.view_url
    }

    #[must_use]
    pub fn messages(&self) -> &Publisher {
        &self.inner.messages
    }

    /// Stream queues, for progress accounting.
    #[must_use]
    pub fn queues(&self) -> Vec<Arc<WorkQueue>> {
        let inner = &self.inner;
        [&inner.metrics, &inner.data, &inner.messages]
            .into_iter()
            .map(|p| Arc::clone(p.queue()))
            .collect()
    }

    #[must_use]
    pub fn uploads_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(self.inner.uploader.in_flight())
    }

    /// Hands one classified record to the streams and the uploader.
    pub fn publish(&self, record: &Classified, timestamp: f64, step: u64) {
        self.publish_metrics(&record.numeric, timestamp, step);
        if !record.data.is_empty() {
            match encode_data(&record.data, timestamp, step) {
                Ok(payload) => self.inner.data.enqueue(payload),
                Err(e) => error!("Failed to encode data record: {}", e),
            }
        }
        if !record.files.is_empty() {
            self.inner.uploader.upload(record.file_pairs(), step);
        }
    }

    pub fn publish_metrics(&self, values: &BTreeMap<String, f64>, timestamp: f64, step: u64) {
        if values.is_empty() {
            return;
        }
        match encode_metrics(values, timestamp, step) {
            Ok(payload) => self.inner.metrics.enqueue(payload),
            Err(e) => error!("Failed to encode metrics record: {}", e),
        }
    }

    /// One meta POST per entry, in the background.
    pub fn register_meta(&self, entries: Vec<MetaEntry>) {
        if entries.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn_on(
            async move {
                for entry in entries {
                    let body = match encode_meta(&inner.run_id, &entry.log_type, &entry.name) {
                        Ok(body) => body,
                        Err(e) => {
                            error!("Failed to encode meta for {}: {}", entry.name, e);
                            continue;
                        }
                    };
                    let req = inner.transport.post_json(&inner.url_meta, body);
                    let what = format!("meta {}", entry.name);
                    if inner.transport.send_with_retry(req, &what).await.is_ok() {
                        debug!("Registered {} as {}", entry.name, entry.log_type);
                    }
                }
            },
            &self.inner.handle,
        );
    }

    /// One trigger request, no retry.
    pub async fn poll_trigger(&self) -> Result<TriggerResponse, TransportError> {
        let body = encode_trigger(&self.inner.run_id)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let resp = Transport::send_once(self.inner.transport.post_json(&self.inner.url_trigger, body))
            .await?;
        resp.json::<TriggerResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    pub async fn update_status(
        &self,
        status: RunStatus,
        metadata: &StatusMetadata,
    ) -> Result<(), TransportError> {
        let body = encode_status(&self.inner.run_id, status, metadata)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let req = self.inner.transport.post_json(&self.inner.url_stop, body);
        self.inner.transport.send_with_retry(req, "status update").await?;
        debug!("Run {} marked {}", self.inner.run_id, status);
        Ok(())
    }

    /// Tells the publishers to drain and exit without waiting for them.
    pub fn cancel(&self) {
        self.inner.stop.cancel();
    }

    /// Drains every stream and waits for background uploads and meta calls.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.tracker.close();
        inner.tracker.wait().await;

        inner.stop.cancel();
        for publisher in [&inner.metrics, &inner.data, &inner.messages] {
            publisher.join().await;
        }
        info!("View run at {}", inner.view_url);
    }
}
