// SPDX-License-Identifier: GPL-3.0-only

//! Per-device status record kept by the state monitor

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, OperationInfo};

/// Lifecycle state of a monitored device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// The device is not monitored.
    #[default]
    NotPresent,
    Idle,
    Mounting,
    Unmounting,
    Checking,
    Repairing,
    CheckDone,
    RepairDone,
    MountDone,
    UnmountDone,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotPresent => "not present",
            Self::Idle => "idle",
            Self::Mounting => "mounting",
            Self::Unmounting => "unmounting",
            Self::Checking => "checking",
            Self::Repairing => "repairing",
            Self::CheckDone => "check done",
            Self::RepairDone => "repair done",
            Self::MountDone => "mount done",
            Self::UnmountDone => "unmount done",
        };
        f.write_str(text)
    }
}

/// Everything the monitor knows about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// An operation is in flight
    pub busy: bool,

    /// Fixed when monitoring starts
    pub removable: bool,

    /// Last known accessibility of the filesystem
    pub mounted: bool,

    /// A filesystem check completed at least once
    pub checked: bool,

    /// The last check or repair reported damage
    pub needs_repair: bool,

    pub last_operation_result: ErrorCode,

    pub last_operation_info: OperationInfo,

    pub state: DeviceState,

    /// When monitoring started. Not refreshed on later transitions.
    pub last_updated: DateTime<Utc>,
}

impl DeviceStatus {
    /// A freshly monitored, idle device.
    pub fn new(removable: bool, mounted: bool) -> Self {
        Self {
            busy: false,
            removable,
            mounted,
            checked: false,
            needs_repair: false,
            last_operation_result: ErrorCode::Success,
            last_operation_info: OperationInfo::Empty,
            state: DeviceState::Idle,
            last_updated: Utc::now(),
        }
    }
}
