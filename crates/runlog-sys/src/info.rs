// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-off description of the host a run executes on.
//!
//! The snapshot is sent with the create-run call and persisted as `sys.json`
//! in the run's working directory.

use crate::human::to_human;
use serde::Serialize;
use std::fs;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Platform {
    pub system: String,
    pub machine: String,
    pub node: Option<String>,
    pub release: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cpu {
    pub physical: usize,
    #[serde(rename = "virtual")]
    pub logical: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    #[serde(rename = "virtual")]
    pub total: Option<String>,
    pub swap: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub platform: Platform,
    pub cpu: Cpu,
    pub memory: Memory,
    /// Seconds since the epoch, when the kernel exposes it
    pub boot_time: Option<u64>,
    pub pid: u32,
}

impl SystemInfo {
    #[must_use]
    pub fn collect() -> Self {
        let node = hostname::get()
            .ok()
            .map(|name| name.to_string_lossy().into_owned());
        if node.is_none() {
            debug!("Could not resolve hostname");
        }

        let (total, swap) = read_memory_totals();

        Self {
            platform: Platform {
                system: std::env::consts::OS.to_string(),
                machine: std::env::consts::ARCH.to_string(),
                node,
                release: read_trimmed("/proc/sys/kernel/osrelease"),
            },
            cpu: Cpu {
                physical: num_cpus::get_physical(),
                logical: num_cpus::get(),
            },
            memory: Memory {
                total: total.map(to_human),
                swap: swap.map(to_human),
            },
            boot_time: read_boot_time(),
            pid: std::process::id(),
        }
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|contents| contents.trim().to_string())
        .filter(|contents| !contents.is_empty())
}

fn read_memory_totals() -> (Option<u64>, Option<u64>) {
    let Ok(contents) = fs::read_to_string("/proc/meminfo") else {
        return (None, None);
    };
    parse_memory_totals(&contents)
}

fn parse_memory_totals(contents: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut swap = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let kb = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok());
        match key {
            "MemTotal" => total = kb.map(|kb| kb * 1024),
            "SwapTotal" => swap = kb.map(|kb| kb * 1024),
            _ => {}
        }
    }
    (total, swap)
}

fn read_boot_time() -> Option<u64> {
    let contents = fs::read_to_string("/proc/stat").ok()?;
    parse_boot_time(&contents)
}

fn parse_boot_time(contents: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|value| value.trim().parse().ok())
}
