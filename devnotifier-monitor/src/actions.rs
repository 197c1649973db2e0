// SPDX-License-Identifier: GPL-3.0-only

//! Which device actions the notifier offers

use std::fmt;

use devnotifier_types::DeviceKind;

use crate::state::DevicesStateMonitor;

/// An action the notifier can offer for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Check the filesystem for errors
    Check,
    /// Unmount the filesystem, or eject the disc
    Unmount,
}

impl ActionKind {
    pub const ALL: [Self; 2] = [Self::Check, Self::Unmount];

    pub fn name(self) -> &'static str {
        match self {
            Self::Check => "Check",
            Self::Unmount => "Unmount",
        }
    }

    /// Whether the action should be offered for the device right now.
    ///
    /// Callers re-evaluate this whenever the state monitor reports a change
    /// for the device.
    pub fn is_valid(self, monitor: &DevicesStateMonitor, udi: &str) -> bool {
        let Some(capabilities) = monitor.capabilities(udi) else {
            return false;
        };
        let backend = monitor.backend();

        match self {
            Self::Check => {
                capabilities.is_storage_volume()
                    && capabilities.supports_check
                    && !backend.is_accessible(udi)
                    && !monitor.is_checked(udi)
            }
            Self::Unmount => {
                let has_access = capabilities.is_storage_volume()
                    || capabilities.is(DeviceKind::OpticalDisc);
                let is_root = backend.mount_point(udi).as_deref() == Some("/");
                has_access && monitor.is_removable(udi) && !is_root && monitor.is_mounted(udi)
            }
        }
    }

    /// All actions currently offered for the device.
    pub fn valid_for(monitor: &DevicesStateMonitor, udi: &str) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|action| action.is_valid(monitor, udi))
            .collect()
    }

    /// Monitored devices this action is offered for, newest first.
    pub fn offered_devices(self, monitor: &DevicesStateMonitor) -> Vec<String> {
        monitor
            .monitored_devices_newest_first()
            .into_iter()
            .filter(|udi| self.is_valid(monitor, udi))
            .collect()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
