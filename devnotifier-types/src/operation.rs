// SPDX-License-Identifier: GPL-3.0-only

//! Operation kinds, result codes and payloads reported by the hardware service

use std::fmt;

use serde::{Deserialize, Serialize};

/// An operation the hardware service can run on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Mount,
    Unmount,
    Eject,
    Check,
    Repair,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Eject => "eject",
            Self::Check => "check",
            Self::Repair => "repair",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed operation, as reported by the hardware service.
///
/// These are stored verbatim; the monitor never produces one of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Success,
    UnauthorizedOperation,
    DeviceBusy,
    OperationFailed,
    UserCanceled,
    InvalidOption,
    MissingDriver,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::UnauthorizedOperation => "unauthorized operation",
            Self::DeviceBusy => "device busy",
            Self::OperationFailed => "operation failed",
            Self::UserCanceled => "canceled by user",
            Self::InvalidOption => "invalid option",
            Self::MissingDriver => "missing driver",
        };
        f.write_str(text)
    }
}

/// Operation specific payload attached to a completed operation.
///
/// For a filesystem check this is `Bool(clean)`; for a mount it is the mount
/// point. Consumers that only care about a yes/no answer use [`Self::as_bool`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum OperationInfo {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl OperationInfo {
    /// Loose boolean view of the payload.
    ///
    /// Numbers are true when non-zero; text is true unless it is empty,
    /// `"0"` or `"false"` (any case).
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Empty => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Text(text) => {
                let text = text.trim();
                !(text.is_empty() || text == "0" || text.eq_ignore_ascii_case("false"))
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<bool> for OperationInfo {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for OperationInfo {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_info_bool_view() {
        assert!(!OperationInfo::Empty.as_bool());
        assert!(OperationInfo::Bool(true).as_bool());
        assert!(!OperationInfo::Bool(false).as_bool());
        assert!(OperationInfo::Int(3).as_bool());
        assert!(!OperationInfo::Int(0).as_bool());
        assert!(OperationInfo::Text("/run/media/user/DISK".to_string()).as_bool());
        assert!(!OperationInfo::Text("False".to_string()).as_bool());
        assert!(!OperationInfo::Text("0".to_string()).as_bool());
        assert!(!OperationInfo::Text(String::new()).as_bool());
    }

    #[test]
    fn error_code_defaults_to_success() {
        assert_eq!(ErrorCode::default(), ErrorCode::Success);
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::DeviceBusy.is_success());
    }

    #[test]
    fn operation_info_serializes_tagged() {
        let json = serde_json::to_string(&OperationInfo::Bool(true)).expect("serialize info");
        assert_eq!(json, r#"{"type":"bool","value":true}"#);
    }
}
