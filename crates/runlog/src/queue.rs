// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

/// Unbounded FIFO of encoded payloads owned by one publisher.
///
/// Producers never block: the lock is held only for the push or pop itself.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<Bytes>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, payload: Bytes) {
        self.items().push_back(payload);
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.items().pop_front()
    }

    /// Puts a failed batch back at the tail, keeping its internal order.
    pub fn requeue(&self, batch: impl IntoIterator<Item = Bytes>) {
        self.items().extend(batch);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}
