// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

const SYMBOLS: [char; 8] = ['K', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y'];

/// Renders a byte count with a binary unit suffix, e.g. `16.0G` or `512B`.
#[must_use]
pub fn to_human(bytes: u64) -> String {
    for (i, symbol) in SYMBOLS.iter().enumerate().rev() {
        // 2^80 and above do not fit in a u64, so those units can never match
        let Some(unit) = 1u64.checked_shl(((i + 1) * 10) as u32) else {
            continue;
        };
        if bytes >= unit {
            return format!("{:.1}{symbol}", bytes as f64 / unit as f64);
        }
    }
    format!("{bytes}B")
}
