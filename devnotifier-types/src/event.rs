// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::{ErrorCode, OperationInfo, OperationKind};

/// A device lifecycle event delivered by the hardware service.
///
/// This is the only input the state monitor accepts besides explicit
/// start/stop calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    /// An operation was started on the device.
    Requested { kind: OperationKind },

    /// A previously requested operation finished.
    Done {
        kind: OperationKind,
        result: ErrorCode,
        info: OperationInfo,
    },

    /// The filesystem became reachable or unreachable outside of any
    /// request/done pair.
    AccessibilityChanged { accessible: bool },
}

impl DeviceEvent {
    pub fn requested(kind: OperationKind) -> Self {
        Self::Requested { kind }
    }

    pub fn done(kind: OperationKind, result: ErrorCode, info: impl Into<OperationInfo>) -> Self {
        Self::Done {
            kind,
            result,
            info: info.into(),
        }
    }

    /// Operation the event belongs to, if any.
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Self::Requested { kind } | Self::Done { kind, .. } => Some(*kind),
            Self::AccessibilityChanged { .. } => None,
        }
    }
}
