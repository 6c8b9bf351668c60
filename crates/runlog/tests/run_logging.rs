// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{mock_create_run, mock_status, null_sampler, settings};
use mockito::{Matcher, Server};
use runlog::file::File;
use runlog::{Mode, Payload, RunBuilder, RunStatus, Settings};

#[tokio::test]
async fn debug_run_ships_and_files_its_diagnostics() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let _create = mock_create_run(&mut server).await;
    let _metrics = server
        .mock("POST", "/ingest/metrics")
        .with_status(200)
        .create_async()
        .await;
    let _data = server
        .mock("POST", "/ingest/data")
        .with_status(200)
        .create_async()
        .await;
    let _register = server
        .mock("POST", "/files")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let warning = server
        .mock("POST", "/ingest/logs")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("invalid file name: my notes".to_string()),
            Matcher::Regex(r#""logType":"WARNING""#.to_string()),
        ]))
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;
    let _logs = server
        .mock("POST", "/ingest/logs")
        .with_status(200)
        .create_async()
        .await;
    let status = mock_status(&mut server, "COMPLETED", 1).await;

    let run = RunBuilder::new(Settings {
        disable_logger: false,
        ..settings(&server.url(), dir.path(), Mode::Debug)
    })
    .sampler(null_sampler())
    .build()
    .await
    .unwrap();
    let work_dir = run.work_dir().unwrap().to_path_buf();

    run.start().unwrap();
    run.console().info("epoch 1 done");
    run.log(
        Payload::new().with("notes", File::text("hello").with_name("my notes")),
        None,
    )
    .unwrap();
    assert_eq!(run.finish().await, RunStatus::Completed);

    warning.assert_async().await;
    status.assert_async().await;

    let sys_log = std::fs::read_to_string(work_dir.join("sys.log")).unwrap();
    assert_eq!(sys_log.lines().count(), 1);
    assert!(sys_log.contains("| INFO    | epoch 1 done"));

    let diagnostics = std::fs::read_to_string(work_dir.join("runlog.log")).unwrap();
    assert!(diagnostics.contains("WARN"));
    assert!(diagnostics.contains("invalid file name: my notes"));
    assert!(!diagnostics.contains("epoch 1 done"));
}
