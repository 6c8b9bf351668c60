// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Settings and mocks shared by the run integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mockito::{Mock, ServerGuard};
use runlog::{Mode, Settings};
use runlog_sys::NullSampler;

pub const RUN_ID: &str = "run-0001";

/// Settings pointing every endpoint at `url`, with millisecond-scale timings.
pub fn settings(url: &str, dir: &Path, mode: Mode) -> Settings {
    Settings {
        auth: "test-token".to_string(),
        project: "demo".to_string(),
        run_name: Some("baseline".to_string()),
        mode,
        dir: dir.to_path_buf(),
        url_api: url.to_string(),
        url_ingest: url.to_string(),
        url_view: format!("{url}/view"),
        retry_max: 2,
        retry_wait_min: Duration::from_millis(1),
        retry_wait_max: Duration::from_millis(4),
        debounce: Duration::from_millis(5),
        internal_check_process: Duration::from_millis(5),
        sys_sampling_interval: Duration::from_millis(50),
        disable_store: false,
        disable_logger: true,
        ..Settings::default()
    }
}

pub fn null_sampler() -> Arc<NullSampler> {
    Arc::new(NullSampler)
}

pub async fn mock_create_run(server: &mut ServerGuard) -> Mock {
    let body = format!(
        r#"{{"runId":"{RUN_ID}","url":"{}/view/demo/{RUN_ID}"}}"#,
        server.url()
    );
    server
        .mock("POST", "/api/runs/create")
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .with_body(body)
        .expect(1)
        .create_async()
        .await
}

/// Accepts every stream POST.
pub async fn mock_streams(server: &mut ServerGuard) -> Vec<Mock> {
    let mut mocks = Vec::new();
    for path in ["/ingest/metrics", "/ingest/data", "/ingest/logs"] {
        mocks.push(
            server
                .mock("POST", path)
                .with_status(200)
                .create_async()
                .await,
        );
    }
    mocks
}

pub async fn mock_status(server: &mut ServerGuard, status: &str, hits: usize) -> Mock {
    server
        .mock("POST", "/api/runs/status/update")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "runId": RUN_ID,
            "status": status,
        })))
        .with_status(200)
        .expect(hits)
        .create_async()
        .await
}
