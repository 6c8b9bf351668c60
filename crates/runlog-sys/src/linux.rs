// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host metrics sampler for Linux.
//!
//! Reads `/proc/stat`, `/proc/meminfo` and `/proc/self/status` on every call.
//! CPU utilisation is the busy share of jiffies elapsed since the previous
//! call, so the first sample carries no `cpu.pct`.
//!
//! Metrics emitted:
//! - `cpu.pct`: host CPU busy percentage
//! - `mem.pct`: host memory in use, percent of total
//! - `mem.used`: host memory in use, bytes
//! - `proc.mem.rss`: resident set size of this process, bytes
//! - `proc.threads`: thread count of this process

use crate::sampler::{Sample, SystemSampler};
use std::fs;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const PROC_STAT_PATH: &str = "/proc/stat"; // Aggregate CPU jiffies on the first `cpu` line
const PROC_MEMINFO_PATH: &str = "/proc/meminfo"; // Host memory counters in kB
const PROC_SELF_STATUS_PATH: &str = "/proc/self/status"; // Per-process counters (VmRSS, Threads)

pub const CPU_PCT: &str = "cpu.pct";
pub const MEM_PCT: &str = "mem.pct";
pub const MEM_USED: &str = "mem.used";
pub const PROC_RSS: &str = "proc.mem.rss";
pub const PROC_THREADS: &str = "proc.threads";

/// Aggregate CPU time counters, in jiffies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Host memory counters, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub available: u64,
}

/// Counters from `/proc/self/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcStatus {
    pub rss_bytes: Option<u64>,
    pub threads: Option<u64>,
}

#[derive(Debug, Default)]
pub struct LinuxSampler {
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl LinuxSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_pct(&self) -> Option<f64> {
        let current = fs::read_to_string(PROC_STAT_PATH)
            .ok()
            .and_then(|contents| contents.lines().next().and_then(parse_cpu_line));
        if current.is_none() {
            debug!("Could not read CPU times from {PROC_STAT_PATH}");
        }
        let current = current?;
        let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last.replace(current)?;
        cpu_pct_between(previous, current)
    }
}

impl SystemSampler for LinuxSampler {
    fn sample(&self) -> Option<Sample> {
        let mut sample = Sample::new();

        if let Some(pct) = self.cpu_pct() {
            sample.insert(CPU_PCT.to_string(), pct);
        }

        match fs::read_to_string(PROC_MEMINFO_PATH).ok().and_then(|c| parse_meminfo(&c)) {
            Some(mem) if mem.total > 0 => {
                let used = mem.total.saturating_sub(mem.available);
                sample.insert(MEM_USED.to_string(), used as f64);
                sample.insert(MEM_PCT.to_string(), 100.0 * used as f64 / mem.total as f64);
            }
            _ => debug!("Could not read memory counters from {PROC_MEMINFO_PATH}"),
        }

        if let Ok(contents) = fs::read_to_string(PROC_SELF_STATUS_PATH) {
            let status = parse_proc_status(&contents);
            if let Some(rss) = status.rss_bytes {
                sample.insert(PROC_RSS.to_string(), rss as f64);
            }
            if let Some(threads) = status.threads {
                sample.insert(PROC_THREADS.to_string(), threads as f64);
            }
        } else {
            debug!("Could not read process status from {PROC_SELF_STATUS_PATH}");
        }

        if sample.is_empty() {
            None
        } else {
            Some(sample)
        }
    }

    fn metric_names(&self) -> Vec<String> {
        [CPU_PCT, MEM_PCT, MEM_USED, PROC_RSS, PROC_THREADS]
            .iter()
            .map(|name| (*name).to_string())
            .collect()
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// The line holds user, nice, system, idle, iowait, irq, softirq, steal and
/// guest counters. Idle and iowait count as not busy; guest time is already
/// folded into user time by the kernel and is ignored.
#[must_use]
pub fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields
        .take(8)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Busy percentage between two reads, `None` when no time elapsed.
#[must_use]
pub fn cpu_pct_between(previous: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.checked_sub(previous.total)?;
    if total == 0 {
        return None;
    }
    let busy = current.busy.saturating_sub(previous.busy);
    Some(100.0 * busy as f64 / total as f64)
}

/// Extracts `MemTotal` and `MemAvailable` from `/proc/meminfo`.
///
/// Kernels older than 3.14 have no `MemAvailable`; free plus buffers plus
/// cached is used instead.
#[must_use]
pub fn parse_meminfo(contents: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;
    let mut fallback = 0u64;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = parse_kb(value) else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(kb * 1024),
            "MemAvailable" => available = Some(kb * 1024),
            "MemFree" | "Buffers" | "Cached" => fallback += kb * 1024,
            _ => {}
        }
    }
    Some(MemInfo {
        total: total?,
        available: available.unwrap_or(fallback),
    })
}

/// Extracts `VmRSS` and `Threads` from `/proc/<pid>/status`.
#[must_use]
pub fn parse_proc_status(contents: &str) -> ProcStatus {
    let mut status = ProcStatus::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "VmRSS" => status.rss_bytes = parse_kb(value).map(|kb| kb * 1024),
            "Threads" => status.threads = value.trim().parse().ok(),
            _ => {}
        }
    }
    status
}

fn parse_kb(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}
