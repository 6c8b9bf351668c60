// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use tracing::debug;

/// Metric name to value, as produced by one sampling pass.
pub type Sample = BTreeMap<String, f64>;

/// Produces host metrics on demand.
///
/// Implementations keep whatever state they need between calls (CPU usage is
/// a delta between two reads) behind interior mutability, so a sampler can be
/// shared across tasks.
pub trait SystemSampler: Send + Sync {
    /// Reads the current values. `None` means nothing could be read this time.
    fn sample(&self) -> Option<Sample>;

    /// Names of every metric this sampler can emit, without any prefix.
    fn metric_names(&self) -> Vec<String>;
}

/// Sampler for platforms without a host reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSampler;

impl SystemSampler for NullSampler {
    fn sample(&self) -> Option<Sample> {
        debug!("No system sampler available on this platform");
        None
    }

    fn metric_names(&self) -> Vec<String> {
        Vec::new()
    }
}
