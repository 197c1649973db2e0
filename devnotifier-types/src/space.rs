// SPDX-License-Identifier: GPL-3.0-only

//! Storage space reporting

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

/// Size of a mounted filesystem as last seen by the space monitor.
///
/// Both fields are `None` while the device is unmounted or its size is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub total: Option<u64>,
    pub available: Option<u64>,
}

impl SpaceInfo {
    pub const UNKNOWN: Self = Self {
        total: None,
        available: None,
    };

    pub fn is_known(&self) -> bool {
        self.total.is_some() && self.available.is_some()
    }
}

impl From<&Usage> for SpaceInfo {
    fn from(usage: &Usage) -> Self {
        Self {
            total: Some(usage.total),
            available: Some(usage.available),
        }
    }
}

/// Filesystem usage statistics in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Total size
    pub total: u64,

    /// Bytes available to unprivileged users
    pub available: u64,

    /// Mount point the statistics were taken from
    pub mount_point: String,
}

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps <= 8 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KB",
        2 => "MB",
        3 => "GB",
        4 => "TB",
        5 => "PB",
        6 => "EB",
        7 => "ZB",
        8 => "YB",
        _ => "Not Supported",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}
