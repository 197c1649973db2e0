// SPDX-License-Identifier: GPL-3.0-only

//! Busy/idle tracking of removable devices

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use devnotifier_types::{
    DeviceCapabilities, DeviceEvent, DeviceState, DeviceStatus, ErrorCode, OperationInfo,
    OperationKind,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::DeviceBackend;
use crate::registry::SharedInstance;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

static INSTANCE: SharedInstance<DevicesStateMonitor> = SharedInstance::new();

/// Live facts about a device needed to apply an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// The device can be repaired.
    pub supports_repair: bool,

    /// Current accessibility as reported by the backend.
    pub accessible: bool,
}

/// Apply one event to a status record.
///
/// Returns the new record, or `None` when the event changes nothing and no
/// notification should be sent.
pub fn transition(
    current: &DeviceStatus,
    event: &DeviceEvent,
    context: &TransitionContext,
) -> Option<DeviceStatus> {
    let mut next = current.clone();

    match event {
        DeviceEvent::Requested { kind } => {
            next.busy = true;
            next.state = match kind {
                OperationKind::Mount => DeviceState::Mounting,
                OperationKind::Unmount | OperationKind::Eject => DeviceState::Unmounting,
                OperationKind::Check => DeviceState::Checking,
                OperationKind::Repair => DeviceState::Repairing,
            };
        }
        DeviceEvent::Done { result, info, .. } => {
            next.busy = false;
            next.last_operation_result = *result;
            next.last_operation_info = info.clone();

            next.state = match current.state {
                DeviceState::Checking => {
                    next.checked = true;
                    next.needs_repair = if result.is_success() {
                        !info.as_bool() && context.supports_repair
                    } else {
                        false
                    };
                    DeviceState::CheckDone
                }
                DeviceState::Repairing => {
                    next.needs_repair = !result.is_success();
                    DeviceState::RepairDone
                }
                DeviceState::Mounting => {
                    next.mounted = context.accessible;
                    DeviceState::MountDone
                }
                DeviceState::Unmounting => {
                    next.mounted = context.accessible;
                    DeviceState::UnmountDone
                }
                _ => DeviceState::Idle,
            };
        }
        DeviceEvent::AccessibilityChanged { accessible } => {
            if current.mounted == *accessible {
                return None;
            }
            next.mounted = *accessible;
        }
    }

    Some(next)
}

struct MonitoredDevice {
    status: DeviceStatus,
    capabilities: DeviceCapabilities,
}

/// Tracks the state of every monitored device.
///
/// Every mutation is followed by exactly one notification carrying the device
/// identifier, sent after the new state is visible to the query methods.
pub struct DevicesStateMonitor {
    backend: Arc<dyn DeviceBackend>,
    devices: RwLock<HashMap<String, MonitoredDevice>>,
    changes: broadcast::Sender<String>,
}

impl DevicesStateMonitor {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        debug!("Devices state monitor created");
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backend,
            devices: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// The process-wide monitor.
    ///
    /// Returns the live instance if anybody still holds one, otherwise builds a
    /// new one around `backend`. The monitor is destroyed when the last holder
    /// drops it.
    pub fn acquire(backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        INSTANCE.acquire(|| Self::new(backend))
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Receive the identifier of every device whose state changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    pub fn start_monitoring(&self, udi: &str) {
        debug!("Devices state monitor: add device {udi}");

        if self.read().contains_key(udi) {
            debug!("Devices state monitor: {udi} is already monitored");
            return;
        }

        let capabilities = self.backend.capabilities(udi).unwrap_or_default();
        let mounted = capabilities.is_storage_volume() && self.backend.is_accessible(udi);
        let status = DeviceStatus::new(capabilities.is_removable(), mounted);

        // Watching under the write lock keeps watch/unwatch in the same order
        // as the inserts and removals they belong to.
        {
            let mut devices = self.write();
            if devices.contains_key(udi) {
                return;
            }
            debug!(
                "Devices state monitor: {udi} removable={} mounted={}",
                status.removable, status.mounted
            );
            self.backend.watch(udi, &capabilities);
            devices.insert(
                udi.to_string(),
                MonitoredDevice {
                    status,
                    capabilities,
                },
            );
        }

        self.notify(udi);
    }

    pub fn stop_monitoring(&self, udi: &str) {
        {
            let mut devices = self.write();
            if devices.remove(udi).is_none() {
                debug!("Devices state monitor: {udi} was not monitored");
                return;
            }
            self.backend.unwatch(udi);
        }

        self.notify(udi);
        debug!("Devices state monitor: {udi} removed");
    }

    /// Feed one event from the backend.
    ///
    /// Events for unmonitored devices, and events the device's capabilities do
    /// not cover, are ignored.
    pub fn handle_event(&self, udi: &str, event: &DeviceEvent) {
        let Some(capabilities) = self.read().get(udi).map(|d| d.capabilities.clone()) else {
            return;
        };

        if !capabilities.accepts(event) {
            debug!("Devices state monitor: {udi} does not handle {event:?}");
            return;
        }

        let mut context = TransitionContext {
            supports_repair: capabilities.supports_repair,
            accessible: false,
        };

        if matches!(event, DeviceEvent::Done { .. }) {
            if !self.backend.is_valid(udi) {
                debug!("Devices state monitor: {udi} is gone, dropping {event:?}");
                return;
            }
            context.accessible = self.backend.is_accessible(udi);
        }

        let changed = {
            let mut devices = self.write();
            let Some(device) = devices.get_mut(udi) else {
                return;
            };
            match transition(&device.status, event, &context) {
                Some(next) => {
                    debug!(
                        "Devices state monitor: {udi} {} -> {} (result: {}, info: {:?})",
                        device.status.state,
                        next.state,
                        next.last_operation_result,
                        next.last_operation_info
                    );
                    device.status = next;
                    true
                }
                None => false,
            }
        };

        if changed {
            self.notify(udi);
        }
    }

    pub fn is_monitored(&self, udi: &str) -> bool {
        self.read().contains_key(udi)
    }

    pub fn monitored_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.read().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Monitored devices, the most recently added first.
    pub fn monitored_devices_newest_first(&self) -> Vec<String> {
        let devices = self.read();
        let mut by_age: Vec<(&String, DateTime<Utc>)> = devices
            .iter()
            .map(|(udi, device)| (udi, device.status.last_updated))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        by_age.into_iter().map(|(udi, _)| udi.clone()).collect()
    }

    /// Copy of the whole record.
    pub fn status(&self, udi: &str) -> Option<DeviceStatus> {
        self.read().get(udi).map(|d| d.status.clone())
    }

    pub fn capabilities(&self, udi: &str) -> Option<DeviceCapabilities> {
        self.read().get(udi).map(|d| d.capabilities.clone())
    }

    pub fn is_busy(&self, udi: &str) -> bool {
        self.field(udi, |s| s.busy).unwrap_or(false)
    }

    pub fn is_removable(&self, udi: &str) -> bool {
        self.field(udi, |s| s.removable).unwrap_or(false)
    }

    pub fn is_mounted(&self, udi: &str) -> bool {
        self.field(udi, |s| s.mounted).unwrap_or(false)
    }

    pub fn is_checked(&self, udi: &str) -> bool {
        self.field(udi, |s| s.checked).unwrap_or(false)
    }

    pub fn needs_repair(&self, udi: &str) -> bool {
        self.field(udi, |s| s.needs_repair).unwrap_or(false)
    }

    /// When monitoring of the device started.
    pub fn timestamp(&self, udi: &str) -> Option<DateTime<Utc>> {
        self.field(udi, |s| s.last_updated)
    }

    pub fn state(&self, udi: &str) -> DeviceState {
        self.field(udi, |s| s.state).unwrap_or(DeviceState::NotPresent)
    }

    pub fn operation_result(&self, udi: &str) -> ErrorCode {
        self.field(udi, |s| s.last_operation_result)
            .unwrap_or_default()
    }

    pub fn operation_info(&self, udi: &str) -> OperationInfo {
        self.field(udi, |s| s.last_operation_info.clone())
            .unwrap_or_default()
    }

    fn field<T>(&self, udi: &str, get: impl FnOnce(&DeviceStatus) -> T) -> Option<T> {
        self.read().get(udi).map(|d| get(&d.status))
    }

    fn notify(&self, udi: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(udi.to_string());
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MonitoredDevice>> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MonitoredDevice>> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for DevicesStateMonitor {
    fn drop(&mut self) {
        debug!("Devices state monitor removed");
    }
}
