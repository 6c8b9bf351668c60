// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # runlog
//!
//! Client runtime that ships experiment telemetry to a remote ingest service
//! while the instrumented process keeps running.
//!
//! ## Architecture
//!
//! - [`run`]: the run controller. Creates the run, hands out steps and
//!   sequences startup and shutdown
//! - [`classify`]: splits each logged payload into metrics, data and files
//! - [`publisher`]: one batching loop per stream with bounded retry
//! - [`uploader`]: two-phase file registration and upload
//! - [`monitor`]: host sampling and remote-cancel polling
//! - [`progress`]: submitted versus pending accounting
//! - [`interface`]: the network sink tying the above together
//! - [`config`]: settings, `RUNLOG_*` environment overrides
//! - [`logger`]: the global subscriber and the per-run log sinks
//!
//! ## Example
//!
//! ```rust,ignore
//! use runlog::{config::get_settings, Payload, RunBuilder, Settings};
//!
//! let settings = get_settings(Settings::default())?;
//! let interrupt = tokio_util::sync::CancellationToken::new();
//! let run = RunBuilder::new(settings)
//!     .interrupt(interrupt.clone())
//!     .build()
//!     .await?;
//! run.start()?;
//! run.log(Payload::new().with("loss", 0.25), None)?;
//! run.finish().await;
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]

pub mod api;
pub mod classify;
pub mod config;
pub mod console;
pub mod error;
pub mod file;
pub mod interface;
pub mod logger;
pub mod monitor;
pub mod progress;
pub mod publisher;
pub mod queue;
pub mod run;
pub mod store;
pub mod transport;
pub mod uploader;
pub mod value;

pub use api::RunStatus;
pub use config::{Mode, Settings};
pub use console::{Console, ConsoleLevel};
pub use error::{FileError, RunError, TransportError};
pub use file::{File, FileKind};
pub use monitor::ExitHook;
pub use run::{Run, RunBuilder};
pub use store::{DataStore, MemoryStore};
pub use value::{CustomValue, LogValue, Payload, ReducesToScalar};
