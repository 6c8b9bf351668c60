// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Step assignment and per-field classification of a logged payload.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::file::Artifact;
use crate::value::{LogValue, Payload};

pub const METRIC: &str = "METRIC";
pub const DATA: &str = "DATA";

/// Next step given the current one and what the caller asked for.
///
/// A larger requested step is adopted, a smaller or equal one keeps the
/// current step, and no request advances by one.
#[must_use]
pub const fn resolve_step(current: u64, requested: Option<u64>) -> u64 {
    match requested {
        Some(step) if step > current => step,
        Some(_) => current,
        None => current + 1,
    }
}

/// The run's single step counter. Assignment is serialized by the lock.
#[derive(Debug, Default)]
pub struct StepCounter {
    step: Mutex<u64>,
}

impl StepCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, requested: Option<u64>) -> u64 {
        let mut step = self.step.lock().unwrap_or_else(PoisonError::into_inner);
        *step = resolve_step(*step, requested);
        *step
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        *self.step.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    pub name: String,
    pub log_type: String,
}

#[derive(Debug, Default)]
struct Seen {
    order: Vec<String>,
    names: HashSet<String>,
}

/// Field names seen during the run, each registered once.
#[derive(Debug, Default)]
pub struct MetaRegistry {
    seen: Mutex<Seen>,
}

impl MetaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> MutexGuard<'_, Seen> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True the first time `name` is seen.
    pub fn register(&self, name: &str) -> bool {
        let mut seen = self.seen();
        if seen.names.contains(name) {
            return false;
        }
        seen.names.insert(name.to_string());
        seen.order.push(name.to_string());
        true
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.seen().order.clone()
    }
}

/// One payload split into the three sinks.
#[derive(Debug, Default)]
pub struct Classified {
    pub numeric: BTreeMap<String, f64>,
    pub data: BTreeMap<String, Vec<Value>>,
    pub files: BTreeMap<String, Vec<Arc<Artifact>>>,
    /// Fields seen for the first time in this payload.
    pub new_meta: Vec<MetaEntry>,
}

impl Classified {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.data.is_empty() && self.files.is_empty()
    }

    /// Files flattened to `(field, artifact)` pairs.
    #[must_use]
    pub fn file_pairs(&self) -> Vec<(String, Arc<Artifact>)> {
        self.files
            .iter()
            .flat_map(|(name, artifacts)| {
                artifacts
                    .iter()
                    .map(move |artifact| (name.clone(), Arc::clone(artifact)))
            })
            .collect()
    }
}

/// Splits `payload` by value type. Files are materialized under `work_dir`;
/// without one they are skipped.
pub fn classify(
    payload: Payload,
    work_dir: Option<&Path>,
    registry: &MetaRegistry,
) -> Result<Classified, RunError> {
    if payload.names().any(str::is_empty) {
        return Err(RunError::Usage("field names must not be empty".to_string()));
    }

    let mut out = Classified::default();
    let mut types: Vec<(String, String)> = Vec::new();

    for (name, value) in payload.into_fields() {
        let log_type = match value {
            LogValue::List(items) => {
                let mut first = None;
                for item in items {
                    if let LogValue::List(_) = item {
                        warn!("{}: nested lists are not supported, skipping element", name);
                        continue;
                    }
                    let log_type = classify_one(&name, item, work_dir, &mut out)?;
                    if first.is_none() {
                        first = log_type;
                    }
                }
                first
            }
            single => classify_one(&name, single, work_dir, &mut out)?,
        };
        if let Some(log_type) = log_type {
            types.push((name, log_type));
        }
    }

    for (name, log_type) in types {
        if registry.register(&name) {
            out.new_meta.push(MetaEntry { name, log_type });
        }
    }
    Ok(out)
}

fn classify_one(
    name: &str,
    value: LogValue,
    work_dir: Option<&Path>,
    out: &mut Classified,
) -> Result<Option<String>, RunError> {
    let log_type = match value {
        LogValue::Int(v) => {
            #[allow(clippy::cast_precision_loss)]
            let v = v as f64;
            out.numeric.insert(name.to_string(), v);
            METRIC.to_string()
        }
        LogValue::Float(v) => {
            out.numeric.insert(name.to_string(), v);
            METRIC.to_string()
        }
        LogValue::Tensor(tensor) => match tensor.to_scalar() {
            Some(v) => {
                out.numeric.insert(name.to_string(), v);
                METRIC.to_string()
            }
            None => {
                warn!(
                    "{}: value of shape {:?} does not reduce to a scalar, skipping",
                    name,
                    tensor.shape()
                );
                return Ok(None);
            }
        },
        LogValue::Json(v) => {
            out.data.entry(name.to_string()).or_default().push(v);
            DATA.to_string()
        }
        LogValue::Custom(custom) => {
            out.data
                .entry(name.to_string())
                .or_default()
                .push(custom.to_json());
            custom.type_name().to_uppercase()
        }
        LogValue::File(file) => {
            let Some(work_dir) = work_dir else {
                debug!("{}: no working directory, skipping file", name);
                return Ok(None);
            };
            let log_type = file.kind().log_type();
            let artifact = file.materialize(work_dir)?;
            out.files.entry(name.to_string()).or_default().push(artifact);
            log_type.to_string()
        }
        LogValue::List(_) => {
            warn!("{}: nested lists are not supported, skipping", name);
            return Ok(None);
        }
    };
    Ok(Some(log_type))
}
