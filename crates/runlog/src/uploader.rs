// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two-phase file upload.
//!
//! ```text
//!   upload(files, step)
//!     └─ task ─ POST files metadata ──> { logName: [{fileName: url}, ...] }
//!                 ├─ match name+ext ─ PUT bytes (retried)
//!                 ├─ match name+ext ─ PUT bytes (retried)
//!                 └─ no match ──────── logged, url stays unset
//! ```
//!
//! Every call gets its own task on the shared tracker, so uploads from
//! different `log()` calls overlap freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::api::{encode_file_batch, FileRegistration};
use crate::file::Artifact;
use crate::transport::Transport;

/// First entry holding the artifact's `name + ext` key, in response order.
#[must_use]
pub fn resolve_upload_url<'a>(
    artifact: &Artifact,
    entries: &'a [HashMap<String, String>],
) -> Option<&'a str> {
    let key = artifact.file_name();
    entries
        .iter()
        .find_map(|entry| entry.get(&key).map(String::as_str))
}

struct InFlight {
    gauge: Arc<AtomicUsize>,
    count: usize,
}

impl InFlight {
    fn new(gauge: &Arc<AtomicUsize>, count: usize) -> Self {
        gauge.fetch_add(count, Ordering::AcqRel);
        Self {
            gauge: Arc::clone(gauge),
            count,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gauge.fetch_sub(self.count, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct Uploader {
    transport: Transport,
    url_files: String,
    tracker: TaskTracker,
    in_flight: Arc<AtomicUsize>,
    handle: Handle,
}

impl Uploader {
    #[must_use]
    pub fn new(transport: Transport, url_files: String, tracker: TaskTracker, handle: Handle) -> Self {
        Self {
            transport,
            url_files,
            tracker,
            in_flight: Arc::new(AtomicUsize::new(0)),
            handle,
        }
    }

    /// Files registered or uploading right now.
    #[must_use]
    pub fn in_flight(&self) -> &Arc<AtomicUsize> {
        &self.in_flight
    }

    /// Registers and uploads `files` in the background.
    pub fn upload(&self, files: Vec<(String, Arc<Artifact>)>, step: u64) {
        if files.is_empty() {
            return;
        }
        let body = match encode_file_batch(&files, step) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode file registration: {}", e);
                return;
            }
        };
        let guard = InFlight::new(&self.in_flight, files.len());
        let transport = self.transport.clone();
        let url = self.url_files.clone();
        self.tracker.spawn_on(
            async move {
                register_and_upload(&transport, &url, body, &files).await;
                drop(guard);
            },
            &self.handle,
        );
    }
}

async fn register_and_upload(
    transport: &Transport,
    url: &str,
    body: Vec<u8>,
    files: &[(String, Arc<Artifact>)],
) {
    let req = transport.post_json(url, body);
    let Ok(resp) = transport.send_with_retry(req, "file registration").await else {
        return;
    };
    let registration: FileRegistration = match resp.json().await {
        Ok(registration) => registration,
        Err(e) => {
            error!(critical = true, "Unexpected file registration response: {}", e);
            return;
        }
    };

    let puts = files.iter().filter_map(|(name, artifact)| {
        let entries = registration.get(name).map_or(&[][..], Vec::as_slice);
        match resolve_upload_url(artifact, entries) {
            Some(url) => {
                artifact.set_url(url);
                Some(put_file(transport, Arc::clone(artifact), url.to_string()))
            }
            None => {
                error!(
                    critical = true,
                    "{}: no upload url for {} in registration response",
                    name,
                    artifact.file_name()
                );
                None
            }
        }
    });
    join_all(puts).await;
}

/// Buffers the whole artifact; every retry resends the same body.
async fn put_file(transport: &Transport, artifact: Arc<Artifact>, url: String) {
    let bytes = match tokio::fs::read(artifact.path()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(
                critical = true,
                "Failed to read {}: {}",
                artifact.path().display(),
                e
            );
            return;
        }
    };
    let what = format!("file {}", artifact.file_name());
    let req = transport.put_bytes(&url, bytes, artifact.mime());
    if transport.send_with_retry(req, &what).await.is_ok() {
        debug!("Uploaded {} ({} bytes)", artifact.file_name(), artifact.size());
    }
}
