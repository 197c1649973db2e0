// SPDX-License-Identifier: GPL-3.0-only

//! Builds device snapshots and capability descriptors directly from UDisks2.

use std::collections::HashMap;

use devnotifier_types::{DeviceCapabilities, DeviceKind, DriveFlags};
use udisks2::block::BlockProxy;
use udisks2::drive::{DriveProxy, MediaCompatibility};
use udisks2::filesystem::FilesystemProxy;
use zbus::Connection;

use crate::dbus::proxies::UDisks2ManagerProxy;
use crate::error::BackendError;

/// What the backend caches about one block object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Device node (e.g. "/dev/sdb1")
    pub device: String,

    /// Filesystem type (e.g. "vfat")
    pub id_type: String,

    /// Filesystem label
    pub id_label: String,

    /// Drive object the block belongs to
    pub drive_path: Option<String>,

    pub capabilities: DeviceCapabilities,

    /// Current mount points, empty when not mounted
    pub mount_points: Vec<String>,
}

impl DeviceSnapshot {
    pub fn is_accessible(&self) -> bool {
        !self.mount_points.is_empty()
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.mount_points.first().map(String::as_str)
    }

    /// Label if set, device node otherwise.
    pub fn display_name(&self) -> &str {
        if self.id_label.is_empty() {
            &self.device
        } else {
            &self.id_label
        }
    }
}

const BLOCK_DEVICES_PREFIX: &str = "/org/freedesktop/UDisks2/block_devices/";

/// Resolve a user supplied device name to a block object path.
///
/// Accepts the object path itself, a device node ("/dev/sdb1") or a bare
/// kernel name ("sdb1").
pub fn object_path_for(id: &str) -> String {
    if id.starts_with("/org/freedesktop/UDisks2/") {
        return id.to_string();
    }

    let name = id.strip_prefix("/dev/").unwrap_or(id);
    format!("{BLOCK_DEVICES_PREFIX}{}", name.replace('-', "_2d"))
}

/// Text of a NUL terminated UDisks2 byte string, `None` when empty.
pub(crate) fn path_from_bytes(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    (end > 0).then(|| String::from_utf8_lossy(&bytes[..end]).into_owned())
}

pub(crate) fn mount_points_from(raw: &[Vec<u8>]) -> Vec<String> {
    raw.iter().filter_map(|bytes| path_from_bytes(bytes)).collect()
}

/// Object paths of every block device UDisks2 knows about.
pub async fn list_block_devices(connection: &Connection) -> Result<Vec<String>, BackendError> {
    let manager = UDisks2ManagerProxy::new(connection).await?;
    let paths = manager.get_block_devices(HashMap::new()).await?;
    Ok(paths.into_iter().map(|p| p.to_string()).collect())
}

/// Drive level facts used for the capability descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DriveFacts {
    pub removable: bool,
    pub media_removable: bool,
    pub hotplug_bus: bool,
    pub optical_media: bool,
    pub optical_drive: bool,
}

/// Block level facts used for the capability descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BlockFacts {
    pub is_partition: bool,
    pub has_filesystem: bool,
    pub can_check: bool,
    pub can_repair: bool,
    pub drive: Option<DriveFacts>,
}

/// Derive the capability descriptor from probed facts.
pub(crate) fn capabilities_from(facts: &BlockFacts) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities::default();

    if facts.has_filesystem {
        caps.kinds |= DeviceKind::StorageVolume;
        caps.supports_check = facts.can_check;
        caps.supports_repair = facts.can_repair;
    }

    if let Some(drive) = facts.drive {
        caps.optical_drive = drive.optical_drive;
        if drive.optical_media {
            caps.kinds |= DeviceKind::OpticalDisc;
        }

        if facts.is_partition || facts.has_filesystem {
            caps.ancestor_drive = Some(DriveFlags {
                removable: drive.media_removable,
                hotpluggable: drive.removable || drive.hotplug_bus,
            });
        } else {
            caps.kinds |= DeviceKind::StorageDrive;
            caps.self_removable = Some(drive.media_removable || drive.removable);
        }
    }

    caps
}

fn is_hotplug_bus(bus: &str) -> bool {
    matches!(bus, "usb" | "ieee1394" | "sdio")
}

/// Media a drive can read that makes it an optical drive.
fn is_optical(media: &MediaCompatibility) -> bool {
    use MediaCompatibility::*;

    matches!(
        media,
        Optical
            | OpticalCd
            | OpticalCdR
            | OpticalCdRw
            | OpticalDvd
            | OpticalDvdR
            | OpticalDvdRw
            | OpticalDvdRam
            | OpticalDvdPlusR
            | OpticalDvdPlusRw
            | OpticalDvdPlusRDl
            | OpticalDvdPlusRwDl
            | OpticalBd
            | OpticalBdR
            | OpticalBdRe
            | OpticalHddvd
            | OpticalHddvdR
            | OpticalHddvdRw
            | OpticalMo
            | OpticalMrw
            | OpticalMrwW
    )
}

async fn probe_drive(connection: &Connection, drive_path: &str) -> Result<DriveFacts, BackendError> {
    let drive = DriveProxy::builder(connection)
        .path(drive_path)?
        .build()
        .await?;

    let media_compatibility = drive.media_compatibility().await.unwrap_or_default();
    let optical_media = drive.optical().await.unwrap_or(false) && drive.media_available().await.unwrap_or(false);

    Ok(DriveFacts {
        removable: drive.removable().await?,
        media_removable: drive.media_removable().await?,
        hotplug_bus: is_hotplug_bus(&drive.connection_bus().await.unwrap_or_default()),
        optical_media,
        optical_drive: optical_media || media_compatibility.iter().any(is_optical),
    })
}

/// Read everything the backend needs about one block object.
pub async fn probe_device(connection: &Connection, udi: &str) -> Result<DeviceSnapshot, BackendError> {
    let block = BlockProxy::builder(connection)
        .path(udi)?
        .build()
        .await?;

    let Ok(device_bytes) = block.preferred_device().await else {
        return Err(BackendError::DeviceNotFound(udi.to_string()));
    };
    let device = match path_from_bytes(&device_bytes) {
        Some(device) => device,
        None => path_from_bytes(&block.device().await?).unwrap_or_default(),
    };
    let id_type = block.id_type().await.unwrap_or_default();
    let id_label = block.id_label().await.unwrap_or_default();

    let is_partition = match udisks2::partition::PartitionProxy::builder(connection)
        .path(udi)?
        .build()
        .await
    {
        Ok(partition) => partition.table().await.is_ok(),
        Err(_) => false,
    };

    let filesystem = FilesystemProxy::builder(connection)
        .path(udi)?
        .build()
        .await?;
    let mount_points = filesystem.mount_points().await.ok();
    let has_filesystem = mount_points.is_some();
    let mount_points = mount_points
        .as_deref()
        .map(mount_points_from)
        .unwrap_or_default();

    let (can_check, can_repair) = if has_filesystem && !id_type.is_empty() {
        let manager = UDisks2ManagerProxy::new(connection).await?;
        (
            manager.can_check(&id_type).await.map(|(ok, _)| ok).unwrap_or(false),
            manager.can_repair(&id_type).await.map(|(ok, _)| ok).unwrap_or(false),
        )
    } else {
        (false, false)
    };

    let drive_path = match block.drive().await {
        Ok(path) if path.as_str() != "/" => Some(path.to_string()),
        _ => None,
    };

    let drive = match &drive_path {
        Some(path) => match probe_drive(connection, path).await {
            Ok(facts) => Some(facts),
            Err(e) => {
                tracing::debug!("Could not read drive {path} of {udi}: {e}");
                None
            }
        },
        None => None,
    };

    let capabilities = capabilities_from(&BlockFacts {
        is_partition,
        has_filesystem,
        can_check,
        can_repair,
        drive,
    });

    Ok(DeviceSnapshot {
        device,
        id_type,
        id_label,
        drive_path,
        capabilities,
        mount_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_stick() -> DriveFacts {
        DriveFacts {
            removable: true,
            media_removable: false,
            hotplug_bus: true,
            optical_media: false,
            optical_drive: false,
        }
    }

    #[test]
    fn partition_on_usb_stick_is_removable_volume() {
        let caps = capabilities_from(&BlockFacts {
            is_partition: true,
            has_filesystem: true,
            can_check: true,
            can_repair: false,
            drive: Some(usb_stick()),
        });

        assert!(caps.is_storage_volume());
        assert!(!caps.is(DeviceKind::StorageDrive));
        assert!(caps.is_removable());
        assert!(caps.supports_check);
        assert!(!caps.supports_repair);
    }

    #[test]
    fn whole_disk_is_storage_drive() {
        let caps = capabilities_from(&BlockFacts {
            drive: Some(usb_stick()),
            ..Default::default()
        });

        assert!(caps.is(DeviceKind::StorageDrive));
        assert_eq!(caps.self_removable, Some(true));
        assert!(caps.ancestor_drive.is_none());
    }

    #[test]
    fn internal_disk_partition_is_not_removable() {
        let caps = capabilities_from(&BlockFacts {
            is_partition: true,
            has_filesystem: true,
            drive: Some(DriveFacts::default()),
            ..Default::default()
        });

        assert!(!caps.is_removable());
    }

    #[test]
    fn optical_disc_with_drive() {
        let caps = capabilities_from(&BlockFacts {
            has_filesystem: true,
            drive: Some(DriveFacts {
                media_removable: true,
                optical_media: true,
                optical_drive: true,
                ..Default::default()
            }),
            ..Default::default()
        });

        assert!(caps.is(DeviceKind::OpticalDisc));
        assert!(caps.optical_drive);
        assert!(caps.is_removable());
    }

    #[test]
    fn check_flags_ignored_without_filesystem() {
        let caps = capabilities_from(&BlockFacts {
            can_check: true,
            can_repair: true,
            ..Default::default()
        });

        assert!(!caps.supports_check);
        assert!(!caps.supports_repair);
        assert!(caps.kinds.is_empty());
    }

    #[test]
    fn optical_media_marks_optical_drives() {
        assert!(is_optical(&MediaCompatibility::OpticalCd));
        assert!(is_optical(&MediaCompatibility::OpticalBdRe));
        assert!(!is_optical(&MediaCompatibility::Thumb));
        assert!(!is_optical(&MediaCompatibility::FlashSd));
    }

    #[test]
    fn byte_strings_stop_at_nul() {
        assert_eq!(
            path_from_bytes(b"/dev/sdb1\0"),
            Some("/dev/sdb1".to_string())
        );
        assert_eq!(path_from_bytes(b"\0"), None);
        assert_eq!(path_from_bytes(b""), None);
        assert_eq!(
            mount_points_from(&[b"/run/media/user/A\0".to_vec(), b"\0".to_vec()]),
            vec!["/run/media/user/A".to_string()]
        );
    }

    #[test]
    fn object_paths_from_device_names() {
        assert_eq!(
            object_path_for("/dev/sdb1"),
            "/org/freedesktop/UDisks2/block_devices/sdb1"
        );
        assert_eq!(
            object_path_for("nvme0n1p2"),
            "/org/freedesktop/UDisks2/block_devices/nvme0n1p2"
        );
        assert_eq!(
            object_path_for("dm-0"),
            "/org/freedesktop/UDisks2/block_devices/dm_2d0"
        );
        assert_eq!(
            object_path_for("/org/freedesktop/UDisks2/block_devices/sr0"),
            "/org/freedesktop/UDisks2/block_devices/sr0"
        );
    }

    #[test]
    fn snapshot_accessibility() {
        let mut snapshot = DeviceSnapshot {
            device: "/dev/sdb1".to_string(),
            ..Default::default()
        };
        assert!(!snapshot.is_accessible());
        assert_eq!(snapshot.display_name(), "/dev/sdb1");

        snapshot.mount_points = vec!["/run/media/user/STICK".to_string()];
        snapshot.id_label = "STICK".to_string();
        assert!(snapshot.is_accessible());
        assert_eq!(snapshot.mount_point(), Some("/run/media/user/STICK"));
        assert_eq!(snapshot.display_name(), "STICK");
    }
}
