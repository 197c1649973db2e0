// SPDX-License-Identifier: GPL-3.0-only

//! In-memory backend for unit tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use devnotifier_types::{DeviceCapabilities, DeviceKind, DriveFlags};
use tokio::sync::broadcast;

use crate::backend::DeviceBackend;

#[derive(Debug, Clone)]
struct MockDevice {
    capabilities: DeviceCapabilities,
    accessible: bool,
    mount_point: Option<String>,
}

#[derive(Default)]
pub(crate) struct MockBackend {
    devices: Mutex<HashMap<String, MockDevice>>,
    watched: Mutex<HashSet<String>>,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add(&self, udi: &str, capabilities: DeviceCapabilities, accessible: bool) {
        let mount_point = accessible.then(|| format!("/run/media/user/{}", short_name(udi)));
        self.devices.lock().unwrap().insert(
            udi.to_string(),
            MockDevice {
                capabilities,
                accessible,
                mount_point,
            },
        );
    }

    pub(crate) fn remove(&self, udi: &str) {
        self.devices.lock().unwrap().remove(udi);
    }

    pub(crate) fn set_accessible(&self, udi: &str, accessible: bool) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(udi) {
            device.accessible = accessible;
            device.mount_point = accessible.then(|| format!("/run/media/user/{}", short_name(udi)));
        }
    }

    pub(crate) fn set_mount_point(&self, udi: &str, mount_point: &str) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(udi) {
            device.accessible = true;
            device.mount_point = Some(mount_point.to_string());
        }
    }

    pub(crate) fn is_watched(&self, udi: &str) -> bool {
        self.watched.lock().unwrap().contains(udi)
    }
}

impl DeviceBackend for MockBackend {
    fn is_valid(&self, udi: &str) -> bool {
        self.devices.lock().unwrap().contains_key(udi)
    }

    fn capabilities(&self, udi: &str) -> Option<DeviceCapabilities> {
        self.devices
            .lock()
            .unwrap()
            .get(udi)
            .map(|d| d.capabilities.clone())
    }

    fn is_accessible(&self, udi: &str) -> bool {
        self.devices
            .lock()
            .unwrap()
            .get(udi)
            .is_some_and(|d| d.accessible)
    }

    fn mount_point(&self, udi: &str) -> Option<String> {
        self.devices
            .lock()
            .unwrap()
            .get(udi)
            .and_then(|d| d.mount_point.clone())
    }

    fn watch(&self, udi: &str, _capabilities: &DeviceCapabilities) {
        self.watched.lock().unwrap().insert(udi.to_string());
    }

    fn unwatch(&self, udi: &str) {
        self.watched.lock().unwrap().remove(udi);
    }
}

/// A mountable volume on a (possibly) hot-pluggable drive.
pub(crate) fn storage_volume(removable: bool) -> DeviceCapabilities {
    DeviceCapabilities {
        kinds: DeviceKind::StorageVolume.into(),
        ancestor_drive: Some(DriveFlags {
            removable,
            hotpluggable: removable,
        }),
        ..Default::default()
    }
}

/// Everything currently queued on a notification receiver.
pub(crate) fn drain(receiver: &mut broadcast::Receiver<String>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(udi) = receiver.try_recv() {
        seen.push(udi);
    }
    seen
}

fn short_name(udi: &str) -> &str {
    udi.rsplit('/').next().unwrap_or(udi)
}
