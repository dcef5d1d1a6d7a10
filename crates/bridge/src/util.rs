// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Small shared helpers used across the bridge.

use chrono::Utc;

/// Current UTC time formatted as ISO 8601 (`2026-02-14T01:23:45Z`).
pub fn iso8601_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current epoch milliseconds, used for cache/fetch timestamps that don't
/// need to be human-readable.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
