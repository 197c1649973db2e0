// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the UDisks2 backend

use devnotifier_types::{ErrorCode, OperationKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("{operation} is not supported by {udi}")]
    NotSupported { udi: String, operation: OperationKind },

    #[error("{operation} failed for {udi}: {code} ({message})")]
    OperationFailed {
        udi: String,
        operation: OperationKind,
        code: ErrorCode,
        message: String,
    },

    #[error("UDisks2 error: {0}")]
    Udisks(#[from] udisks2::Error),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
}

impl BackendError {
    /// Result code reported to the state monitor for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::OperationFailed { code, .. } => *code,
            Self::NotSupported { .. } => ErrorCode::MissingDriver,
            Self::Udisks(e) => error_code_for(e),
            Self::DBus(e) => dbus_error_code(e),
            Self::ConnectionFailed(_) | Self::DeviceNotFound(_) => ErrorCode::OperationFailed,
        }
    }
}

/// Map a failed UDisks2 call to a result code.
pub fn error_code_for(error: &udisks2::Error) -> ErrorCode {
    use udisks2::Error;

    match error {
        Error::NotAuthorized | Error::NotAuthorizedCanObtain => ErrorCode::UnauthorizedOperation,
        Error::NotAuthorizedDismissed | Error::Cancelled | Error::AlreadyCancelled => {
            ErrorCode::UserCanceled
        }
        Error::DeviceBusy | Error::MountedByOtherUser | Error::AlreadyUnmounting => {
            ErrorCode::DeviceBusy
        }
        Error::OptionNotPermitted => ErrorCode::InvalidOption,
        Error::NotSupported => ErrorCode::MissingDriver,
        Error::Zbus(e) => dbus_error_code(e),
        _ => ErrorCode::OperationFailed,
    }
}

/// Errors udisks2 leaves as plain zbus errors: standard FDO replies mostly.
fn dbus_error_code(error: &zbus::Error) -> ErrorCode {
    match error {
        zbus::Error::FDO(fdo) => match fdo.as_ref() {
            zbus::fdo::Error::AccessDenied(_) | zbus::fdo::Error::AuthFailed(_) => {
                ErrorCode::UnauthorizedOperation
            }
            zbus::fdo::Error::NotSupported(_) => ErrorCode::MissingDriver,
            zbus::fdo::Error::InvalidArgs(_) => ErrorCode::InvalidOption,
            _ => ErrorCode::OperationFailed,
        },
        _ => ErrorCode::OperationFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udisks_errors_map_to_codes() {
        assert_eq!(
            error_code_for(&udisks2::Error::NotAuthorizedCanObtain),
            ErrorCode::UnauthorizedOperation
        );
        assert_eq!(
            error_code_for(&udisks2::Error::NotAuthorizedDismissed),
            ErrorCode::UserCanceled
        );
        assert_eq!(error_code_for(&udisks2::Error::Cancelled), ErrorCode::UserCanceled);
        assert_eq!(error_code_for(&udisks2::Error::DeviceBusy), ErrorCode::DeviceBusy);
        assert_eq!(
            error_code_for(&udisks2::Error::OptionNotPermitted),
            ErrorCode::InvalidOption
        );
        assert_eq!(error_code_for(&udisks2::Error::NotSupported), ErrorCode::MissingDriver);
        assert_eq!(error_code_for(&udisks2::Error::Failed), ErrorCode::OperationFailed);
        assert_eq!(error_code_for(&udisks2::Error::TimedOut), ErrorCode::OperationFailed);
    }

    #[test]
    fn access_denied_from_the_bus_is_unauthorized() {
        let denied = udisks2::Error::from(zbus::fdo::Error::AccessDenied("denied".to_string()));
        assert_eq!(error_code_for(&denied), ErrorCode::UnauthorizedOperation);
    }

    #[test]
    fn backend_error_codes() {
        let err = BackendError::NotSupported {
            udi: "/org/freedesktop/UDisks2/block_devices/sda".to_string(),
            operation: OperationKind::Eject,
        };
        assert_eq!(err.code(), ErrorCode::MissingDriver);
        assert_eq!(
            err.to_string(),
            "eject is not supported by /org/freedesktop/UDisks2/block_devices/sda"
        );

        let busy = BackendError::from(udisks2::Error::DeviceBusy);
        assert_eq!(busy.code(), ErrorCode::DeviceBusy);

        let fdo = BackendError::DBus(zbus::Error::FDO(Box::new(
            zbus::fdo::Error::InvalidArgs("bad option".to_string()),
        )));
        assert_eq!(fdo.code(), ErrorCode::InvalidOption);
    }
}
