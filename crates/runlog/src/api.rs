// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire payloads for the remote service.
//!
//! Everything here is a pure function from a logged value to the exact bytes
//! sent on the wire. Stream payloads are newline-delimited JSON; each payload
//! already ends with `\n`, so a batch is the plain concatenation of its
//! payloads.
//!
//! | Endpoint        | Body                                                        |
//! |-----------------|-------------------------------------------------------------|
//! | create-run      | `{runName, projectName, metadata, systemMetadata}`          |
//! | status update   | `{runId, status, statusMetadata}`                           |
//! | meta            | `{runId, logType, logName}`                                 |
//! | metrics / data  | one `{time, step, data}` line per record                    |
//! | messages        | one `{time, message, lineNumber, logType}` line per message |
//! | files           | `{files: [{fileName, size, fileType, logName, step}]}`      |
//! | trigger         | `{runId}`                                                   |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::file::Artifact;

/// Final state reported for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RunStatus {
    /// Process-style status code: -1 running, 0 completed, 1 failed, 2 terminated.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            RunStatus::Running => -1,
            RunStatus::Completed => 0,
            RunStatus::Failed => 1,
            RunStatus::Terminated => 2,
        }
    }

    /// Maps an exit code to a status. Unknown non-zero codes count as failures.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            -1 => RunStatus::Running,
            0 => RunStatus::Completed,
            2 => RunStatus::Terminated,
            _ => RunStatus::Failed,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Terminated => "TERMINATED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a failure trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub name: String,
    pub line: Option<String>,
}

/// Failure details attached to a terminated run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureTrace {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub frames: Vec<Frame>,
    pub trace: String,
}

/// Content of the `statusMetadata` string
#[derive(Debug, Clone, PartialEq)]
pub enum StatusMetadata {
    /// Field names seen during the run
    Names(Vec<String>),
    Failure(FailureTrace),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
}

impl TriggerResponse {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status == "CANCELLED"
    }
}

/// Files-registration response: field name to `{fileName: uploadUrl}` entries.
pub type FileRegistration = HashMap<String, Vec<HashMap<String, String>>>;

#[derive(Serialize)]
struct StreamLine<'a, T: Serialize> {
    time: i64,
    step: u64,
    data: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageLine<'a> {
    time: i64,
    message: &'a str,
    line_number: u64,
    log_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBody<'a> {
    run_name: &'a str,
    project_name: &'a str,
    metadata: String,
    system_metadata: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    run_id: &'a str,
    status: RunStatus,
    status_metadata: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaBody<'a> {
    run_id: &'a str,
    log_type: &'a str,
    log_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry<'a> {
    file_name: String,
    size: u64,
    file_type: &'a str,
    log_name: &'a str,
    step: u64,
}

#[derive(Serialize)]
struct FileBatch<'a> {
    files: Vec<FileEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerBody<'a> {
    run_id: &'a str,
}

/// Current wall-clock time in seconds since the epoch.
#[must_use]
pub fn now() -> f64 {
    let now = chrono::Utc::now();
    #[allow(clippy::cast_precision_loss)]
    let millis = now.timestamp_millis() as f64;
    millis / 1000.0
}

/// Seconds since the epoch to whole milliseconds.
#[must_use]
pub fn to_millis(timestamp: f64) -> i64 {
    (timestamp * 1000.0) as i64
}

fn line<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let mut buf = BytesMut::new().writer();
    serde_json::to_writer(&mut buf, value)?;
    let mut buf = buf.into_inner();
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// All numeric values of one record as a single line.
pub fn encode_metrics(
    values: &BTreeMap<String, f64>,
    timestamp: f64,
    step: u64,
) -> Result<Bytes, serde_json::Error> {
    line(&StreamLine {
        time: to_millis(timestamp),
        step,
        data: values,
    })
}

/// One line per key. A key with a single value carries it as is; several
/// values logged under one key are sent as an array.
pub fn encode_data(
    values: &BTreeMap<String, Vec<Value>>,
    timestamp: f64,
    step: u64,
) -> Result<Bytes, serde_json::Error> {
    let time = to_millis(timestamp);
    let mut buf = BytesMut::new();
    for (key, items) in values {
        let value = match items.as_slice() {
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        };
        let data: BTreeMap<&str, Value> = BTreeMap::from([(key.as_str(), value)]);
        buf.extend_from_slice(&line(&StreamLine {
            time,
            step,
            data: &data,
        })?);
    }
    Ok(buf.freeze())
}

pub fn encode_message(
    level: &str,
    message: &str,
    timestamp: f64,
    line_number: u64,
) -> Result<Bytes, serde_json::Error> {
    line(&MessageLine {
        time: to_millis(timestamp),
        message,
        line_number,
        log_type: level,
    })
}

/// Create-run body. Config and system info travel as JSON strings.
pub fn encode_start<S: Serialize>(
    run_name: &str,
    project: &str,
    config: &Value,
    system: &S,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StartBody {
        run_name,
        project_name: project,
        metadata: serde_json::to_string(config)?,
        system_metadata: serde_json::to_string(system)?,
    })
}

pub fn encode_status(
    run_id: &str,
    status: RunStatus,
    metadata: &StatusMetadata,
) -> Result<Vec<u8>, serde_json::Error> {
    let status_metadata = match metadata {
        StatusMetadata::Names(names) => serde_json::to_string(names)?,
        StatusMetadata::Failure(trace) => serde_json::to_string(trace)?,
    };
    serde_json::to_vec(&StatusBody {
        run_id,
        status,
        status_metadata,
    })
}

pub fn encode_meta(run_id: &str, log_type: &str, name: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&MetaBody {
        run_id,
        log_type,
        log_name: name,
    })
}

/// Registration body for every file of one `log()` call.
pub fn encode_file_batch(
    files: &[(String, Arc<Artifact>)],
    step: u64,
) -> Result<Vec<u8>, serde_json::Error> {
    let files = files
        .iter()
        .map(|(name, artifact)| FileEntry {
            file_name: artifact.file_name(),
            size: artifact.size(),
            file_type: artifact.file_type(),
            log_name: name,
            step,
        })
        .collect();
    serde_json::to_vec(&FileBatch { files })
}

pub fn encode_trigger(run_id: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&TriggerBody { run_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_str(bytes: &[u8]) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_metrics_line() {
        let values = BTreeMap::from([("acc".to_string(), 0.5), ("loss".to_string(), 1.25)]);
        let bytes = encode_metrics(&values, 1_700_000_000.5, 7).unwrap();
        assert_eq!(
            as_str(&bytes),
            "{\"time\":1700000000500,\"step\":7,\"data\":{\"acc\":0.5,\"loss\":1.25}}\n"
        );
    }

    #[test]
    fn test_data_lines_per_key() {
        let values = BTreeMap::from([
            ("table".to_string(), vec![json!({"a": 1})]),
            ("tags".to_string(), vec![json!("x"), json!("y")]),
        ]);
        let bytes = encode_data(&values, 2.0, 1).unwrap();
        let lines: Vec<&str> = as_str(&bytes).lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"time\":2000,\"step\":1,\"data\":{\"table\":{\"a\":1}}}");
        assert_eq!(lines[1], "{\"time\":2000,\"step\":1,\"data\":{\"tags\":[\"x\",\"y\"]}}");
        assert!(as_str(&bytes).ends_with('\n'));
    }

    #[test]
    fn test_message_line() {
        let bytes = encode_message("WARNING", "disk almost full", 1.5, 3).unwrap();
        assert_eq!(
            as_str(&bytes),
            "{\"time\":1500,\"message\":\"disk almost full\",\"lineNumber\":3,\"logType\":\"WARNING\"}\n"
        );
    }

    #[test]
    fn test_start_body_nests_json_strings() {
        let body = encode_start("20240101", "mnist", &json!({"lr": 0.1}), &json!({"os": "linux"}))
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["runName"], "20240101");
        assert_eq!(value["projectName"], "mnist");
        assert_eq!(value["metadata"], "{\"lr\":0.1}");
        assert_eq!(value["systemMetadata"], "{\"os\":\"linux\"}");
    }

    #[test]
    fn test_status_body_with_names() {
        let body = encode_status(
            "r1",
            RunStatus::Completed,
            &StatusMetadata::Names(vec!["loss".into(), "acc".into()]),
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["runId"], "r1");
        assert_eq!(value["status"], "COMPLETED");
        assert_eq!(value["statusMetadata"], "[\"loss\",\"acc\"]");
    }

    #[test]
    fn test_status_body_with_failure() {
        let trace = FailureTrace {
            kind: "Shutdown".into(),
            message: "store failed".into(),
            frames: vec![Frame {
                filename: Some("src/run.rs".into()),
                lineno: Some(10),
                name: "runlog::run::finish".into(),
                line: None,
            }],
            trace: "0: runlog::run::finish".into(),
        };
        let body =
            encode_status("r1", RunStatus::Terminated, &StatusMetadata::Failure(trace)).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "TERMINATED");
        let meta: Value = serde_json::from_str(value["statusMetadata"].as_str().unwrap()).unwrap();
        assert_eq!(meta["type"], "Shutdown");
        assert_eq!(meta["frames"][0]["lineno"], 10);
    }

    #[test]
    fn test_meta_and_trigger_bodies() {
        let body = encode_meta("r1", "METRIC", "loss").unwrap();
        assert_eq!(
            as_str(&body),
            "{\"runId\":\"r1\",\"logType\":\"METRIC\",\"logName\":\"loss\"}"
        );
        assert_eq!(as_str(&encode_trigger("r1").unwrap()), "{\"runId\":\"r1\"}");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RunStatus::from_code(0), RunStatus::Completed);
        assert_eq!(RunStatus::from_code(2), RunStatus::Terminated);
        assert_eq!(RunStatus::from_code(137), RunStatus::Failed);
        assert_eq!(RunStatus::Running.code(), -1);
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_responses_decode() {
        let created: CreateRunResponse =
            serde_json::from_value(json!({"runId": "abc", "url": "http://view/abc"})).unwrap();
        assert_eq!(created.run_id, "abc");
        let trigger: TriggerResponse = serde_json::from_value(json!({"status": "CANCELLED"})).unwrap();
        assert!(trigger.is_cancelled());
    }
}
