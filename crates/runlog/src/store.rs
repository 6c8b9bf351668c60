// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local persistence sink.
//!
//! The run feeds every classified record to a [`DataStore`] before handing it
//! to the network sink, and stops the store before stopping the network sink.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::file::Artifact;

pub type StoreError = Box<dyn Error + Send + Sync>;

pub trait DataStore: Send + Sync {
    fn insert(
        &self,
        numeric: &BTreeMap<String, f64>,
        data: &BTreeMap<String, Vec<Value>>,
        files: &BTreeMap<String, Vec<Arc<Artifact>>>,
        timestamp: f64,
        step: u64,
    );

    fn stop(&self) -> Result<(), StoreError>;
}

/// One inserted record, as kept by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub numeric: BTreeMap<String, f64>,
    pub data: BTreeMap<String, Vec<Value>>,
    /// Field name to materialized file names.
    pub files: BTreeMap<String, Vec<String>>,
    pub timestamp: f64,
    pub step: u64,
}

/// Keeps rows in memory. Useful when a caller wants to inspect what a run
/// recorded without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Row>>,
    stopped: Mutex<bool>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataStore for MemoryStore {
    fn insert(
        &self,
        numeric: &BTreeMap<String, f64>,
        data: &BTreeMap<String, Vec<Value>>,
        files: &BTreeMap<String, Vec<Arc<Artifact>>>,
        timestamp: f64,
        step: u64,
    ) {
        let files = files
            .iter()
            .map(|(name, artifacts)| {
                (
                    name.clone(),
                    artifacts.iter().map(|a| a.file_name()).collect(),
                )
            })
            .collect();
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Row {
                numeric: numeric.clone(),
                data: data.clone(),
                files,
                timestamp,
                step,
            });
    }

    fn stop(&self) -> Result<(), StoreError> {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_records_rows() {
        let store = MemoryStore::new();
        let numeric = BTreeMap::from([("loss".to_string(), 0.5)]);
        store.insert(&numeric, &BTreeMap::new(), &BTreeMap::new(), 1.0, 3);
        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].step, 3);
        assert_eq!(rows[0].numeric["loss"], 0.5);

        assert!(!store.is_stopped());
        store.stop().unwrap();
        assert!(store.is_stopped());
    }
}
