// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{mock_create_run, mock_status, null_sampler, settings};
use mockito::{Matcher, Server};
use runlog::{Mode, Payload, RunBuilder, RunStatus};

#[tokio::test]
async fn failing_stream_is_retried_then_dropped() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let _create = mock_create_run(&mut server).await;
    let metrics = server
        .mock("POST", "/ingest/metrics")
        .with_status(500)
        .with_body("ingest unavailable")
        .expect(2)
        .create_async()
        .await;
    let status = mock_status(&mut server, "COMPLETED", 1).await;

    let run = RunBuilder::new(settings(&server.url(), dir.path(), Mode::Debug))
        .sampler(null_sampler())
        .build()
        .await
        .unwrap();
    run.start().unwrap();
    run.log(Payload::new().with("loss", 0.3), None).unwrap();

    // a dropped batch does not fail the run
    assert_eq!(run.finish().await, RunStatus::Completed);
    metrics.assert_async().await;
    status.assert_async().await;
}

#[tokio::test]
async fn stream_lines_carry_step_and_values() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let _create = mock_create_run(&mut server).await;
    let metrics = server
        .mock("POST", "/ingest/metrics")
        .match_header("content-type", "application/x-ndjson")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""step":7"#.to_string()),
            Matcher::Regex(r#""loss":0.5"#.to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let data = server
        .mock("POST", "/ingest/data")
        .match_body(Matcher::Regex(r#""note""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let _status = mock_status(&mut server, "COMPLETED", 1).await;

    let run = RunBuilder::new(settings(&server.url(), dir.path(), Mode::Debug))
        .sampler(null_sampler())
        .build()
        .await
        .unwrap();
    run.start().unwrap();
    run.log(
        Payload::new().with("loss", 0.5).with("note", "warmup done"),
        Some(7),
    )
    .unwrap();
    run.finish().await;

    metrics.assert_async().await;
    data.assert_async().await;
}
