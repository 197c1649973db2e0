// SPDX-License-Identifier: GPL-3.0-only

//! Capability descriptor computed once when a device starts being monitored

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::{DeviceEvent, OperationKind};

/// Kinds of device the hardware service can report for one identifier.
///
/// A single device usually carries several of these (an optical disc is also a
/// storage volume).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    OpticalDisc = 1 << 0,
    StorageVolume = 1 << 1,
    StorageDrive = 1 << 2,
    Camera = 1 << 3,
    PortableMediaPlayer = 1 << 4,
}

/// Removability hints of the drive a device lives on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFlags {
    pub removable: bool,
    pub hotpluggable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub kinds: BitFlags<DeviceKind>,

    /// The storage access can run a filesystem check.
    pub supports_check: bool,

    /// The storage access can run a filesystem repair.
    pub supports_repair: bool,

    /// An optical drive is reachable from the device (used for eject).
    pub optical_drive: bool,

    /// Removable flag of the device itself when it is a storage drive.
    pub self_removable: Option<bool>,

    /// Flags of the closest ancestor storage drive, if there is one.
    pub ancestor_drive: Option<DriveFlags>,
}

impl DeviceCapabilities {
    pub fn is(&self, kind: DeviceKind) -> bool {
        self.kinds.contains(kind)
    }

    pub fn is_storage_volume(&self) -> bool {
        self.is(DeviceKind::StorageVolume)
    }

    /// Whether the device should be presented as removable.
    pub fn is_removable(&self) -> bool {
        self.self_removable.unwrap_or(false)
            || self
                .ancestor_drive
                .is_some_and(|drive| drive.removable || drive.hotpluggable)
            || self.kinds.intersects(DeviceKind::Camera | DeviceKind::PortableMediaPlayer)
    }

    /// Whether events of this operation are wired for the device.
    pub fn accepts_operation(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Eject => self.is(DeviceKind::OpticalDisc) && self.optical_drive,
            OperationKind::Mount | OperationKind::Unmount => self.is_storage_volume(),
            OperationKind::Check => self.is_storage_volume() && self.supports_check,
            OperationKind::Repair => self.is_storage_volume() && self.supports_repair,
        }
    }

    /// Whether the event would have a subscription for the device.
    pub fn accepts(&self, event: &DeviceEvent) -> bool {
        match event.operation() {
            Some(kind) => self.accepts_operation(kind),
            None => self.is_storage_volume(),
        }
    }
}
