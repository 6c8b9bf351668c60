// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host sampling for runlog.
//!
//! Two things live here: a [`SystemSampler`] that produces the periodic
//! host metrics shipped while a run is active, and a [`SystemInfo`] snapshot
//! taken once when a run is created.
//!
//! Only Linux has a real sampler (it reads `/proc`). Every other platform gets
//! the [`NullSampler`], which reports nothing.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod human;
pub mod info;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod sampler;

pub use human::to_human;
pub use info::SystemInfo;
pub use sampler::{NullSampler, SystemSampler};

use std::sync::Arc;

/// Returns the sampler for the platform the process runs on.
#[must_use]
pub fn default_sampler() -> Arc<dyn SystemSampler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxSampler::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NullSampler)
    }
}
