// SPDX-License-Identifier: GPL-3.0-only

//! Free space tracking for mounted devices

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use devnotifier_types::{SpaceInfo, Usage};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::SharedInstance;
use crate::state::DevicesStateMonitor;
use crate::usage::usage_for_mount_point;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Refresh period used while sizes are on screen.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

static INSTANCE: SharedInstance<SpaceMonitor> = SharedInstance::new();

/// Reads filesystem usage for a mount point.
pub trait SpaceProbe: Send + Sync {
    fn probe(&self, mount_point: &str) -> Result<Usage>;
}

/// [`SpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn probe(&self, mount_point: &str) -> Result<Usage> {
        usage_for_mount_point(mount_point)
    }
}

#[derive(Default)]
struct Tasks {
    refresher: Option<JoinHandle<()>>,
    follower: Option<JoinHandle<()>>,
}

/// Keeps the size and free space of monitored devices.
pub struct SpaceMonitor {
    state_monitor: Arc<DevicesStateMonitor>,
    probe: Arc<dyn SpaceProbe>,
    sizes: RwLock<HashMap<String, SpaceInfo>>,
    changes: broadcast::Sender<String>,
    refresh_interval: Duration,
    tasks: Mutex<Tasks>,
}

impl SpaceMonitor {
    pub fn new(
        state_monitor: Arc<DevicesStateMonitor>,
        probe: Arc<dyn SpaceProbe>,
        refresh_interval: Duration,
    ) -> Self {
        debug!("Space monitor initialized");
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state_monitor,
            probe,
            sizes: RwLock::new(HashMap::new()),
            changes,
            refresh_interval,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// The process-wide space monitor, built on first use.
    pub fn acquire(state_monitor: Arc<DevicesStateMonitor>, refresh_interval: Duration) -> Arc<Self> {
        INSTANCE.acquire(|| Self::new(state_monitor, Arc::new(StatvfsProbe), refresh_interval))
    }

    /// Receive the identifier of every device whose size changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    pub fn space(&self, udi: &str) -> SpaceInfo {
        self.read().get(udi).copied().unwrap_or_default()
    }

    pub fn full_size(&self, udi: &str) -> Option<u64> {
        self.space(udi).total
    }

    pub fn free_size(&self, udi: &str) -> Option<u64> {
        self.space(udi).available
    }

    pub fn add_monitoring_device(&self, udi: &str) {
        debug!("Space monitor: adding device {udi}");
        self.update_storage_space(udi);
    }

    pub fn remove_monitoring_device(&self, udi: &str) {
        if self.write().remove(udi).is_some() {
            debug!("Space monitor: removed device {udi}");
            self.notify(udi);
        } else {
            debug!("Space monitor: device {udi} not found");
        }
    }

    /// Refresh one device, only if it is already tracked.
    pub fn force_update_size(&self, udi: &str) {
        if self.read().contains_key(udi) {
            debug!("Space monitor: forced size update for {udi}");
            self.update_storage_space(udi);
        } else {
            debug!("Space monitor: device {udi} not found");
        }
    }

    /// React to a state change notification of the device state monitor.
    pub fn on_state_changed(&self, udi: &str) {
        if self.state_monitor.is_monitored(udi) {
            self.update_storage_space(udi);
        } else {
            self.remove_monitoring_device(udi);
        }
    }

    pub fn update_all(&self) {
        for udi in self.known_devices() {
            self.update_storage_space(&udi);
        }
    }

    /// Like [`Self::add_monitoring_device`], with `statvfs` run on the
    /// blocking thread pool. Must be called inside a tokio runtime.
    pub async fn refresh_storage_space(&self, udi: &str) {
        let Some(mount_point) = self.accessible_mount_point(udi) else {
            self.store_unknown(udi);
            return;
        };

        let probe = self.probe.clone();
        let probed = mount_point.clone();
        match tokio::task::spawn_blocking(move || probe.probe(&probed)).await {
            Ok(usage) => self.store_usage(udi, usage),
            Err(e) => warn!("Space monitor: size probe for {mount_point} did not finish: {e}"),
        }
    }

    async fn refresh_all(&self) {
        for udi in self.known_devices() {
            self.refresh_storage_space(&udi).await;
        }
    }

    fn known_devices(&self) -> Vec<String> {
        let devices: Vec<String> = self.read().keys().cloned().collect();
        if !devices.is_empty() {
            debug!("Space monitor: updating {} devices", devices.len());
        }
        devices
    }

    /// Start or stop periodic refreshing.
    ///
    /// Becoming visible refreshes every device right away and then every
    /// refresh interval until hidden again. Must be called inside a tokio
    /// runtime.
    pub fn set_visible(self: &Arc<Self>, visible: bool) {
        debug!("Space monitor: visible changed to {visible}");
        let mut tasks = self.tasks();

        if !visible {
            if let Some(refresher) = tasks.refresher.take() {
                refresher.abort();
            }
            return;
        }

        if tasks.refresher.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.refresh_interval;
        tasks.refresher = Some(tokio::spawn(async move {
            // The first tick completes immediately.
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.refresh_all().await;
            }
        }));
    }

    pub fn is_refreshing(&self) -> bool {
        self.tasks()
            .refresher
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Refresh sizes whenever the device state monitor reports a change.
    pub fn follow_state_changes(self: &Arc<Self>) {
        let mut changes = self.state_monitor.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);

        let follower = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(udi) => {
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        if monitor.state_monitor.is_monitored(&udi) {
                            monitor.refresh_storage_space(&udi).await;
                        } else {
                            monitor.remove_monitoring_device(&udi);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Space monitor: missed {missed} state changes, refreshing all");
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        monitor.refresh_all().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.tasks().follower.replace(follower) {
            previous.abort();
        }
    }

    fn update_storage_space(&self, udi: &str) {
        match self.accessible_mount_point(udi) {
            Some(mount_point) => self.store_usage(udi, self.probe.probe(&mount_point)),
            None => self.store_unknown(udi),
        }
    }

    fn accessible_mount_point(&self, udi: &str) -> Option<String> {
        let backend = self.state_monitor.backend();
        if backend.is_accessible(udi) {
            backend.mount_point(udi)
        } else {
            None
        }
    }

    fn store_unknown(&self, udi: &str) {
        debug!("Space monitor: {udi} is not accessible");
        self.write().insert(udi.to_string(), SpaceInfo::UNKNOWN);
        self.notify(udi);
    }

    fn store_usage(&self, udi: &str, usage: Result<Usage>) {
        match usage {
            Ok(usage) => {
                debug!(
                    "Space monitor: {udi} size {} free {}",
                    usage.total, usage.available
                );
                self.write().insert(udi.to_string(), SpaceInfo::from(&usage));
                self.notify(udi);
            }
            Err(e) => {
                debug!("Space monitor: failed to get size for {udi}: {e:#}");
            }
        }
    }

    fn notify(&self, udi: &str) {
        let _ = self.changes.send(udi.to_string());
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SpaceInfo>> {
        self.sizes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SpaceInfo>> {
        self.sizes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SpaceMonitor {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in [tasks.refresher.take(), tasks.follower.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        debug!("Space monitor removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, drain, storage_volume};

    const UDI: &str = "/org/freedesktop/UDisks2/block_devices/sdc1";

    struct FixedProbe {
        total: u64,
        available: u64,
    }

    impl SpaceProbe for FixedProbe {
        fn probe(&self, mount_point: &str) -> Result<Usage> {
            Ok(Usage {
                total: self.total,
                available: self.available,
                mount_point: mount_point.to_string(),
            })
        }
    }

    struct FailingProbe;

    impl SpaceProbe for FailingProbe {
        fn probe(&self, mount_point: &str) -> Result<Usage> {
            anyhow::bail!("cannot stat {mount_point}")
        }
    }

    fn space_monitor(backend: &Arc<MockBackend>, probe: Arc<dyn SpaceProbe>) -> Arc<SpaceMonitor> {
        let state = Arc::new(DevicesStateMonitor::new(backend.clone()));
        Arc::new(SpaceMonitor::new(state, probe, DEFAULT_REFRESH_INTERVAL))
    }

    fn fixed() -> Arc<dyn SpaceProbe> {
        Arc::new(FixedProbe {
            total: 8_000,
            available: 3_000,
        })
    }

    #[test]
    fn mounted_device_reports_sizes() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let monitor = space_monitor(&backend, fixed());
        let mut changes = monitor.subscribe();

        monitor.add_monitoring_device(UDI);

        assert_eq!(monitor.full_size(UDI), Some(8_000));
        assert_eq!(monitor.free_size(UDI), Some(3_000));
        assert_eq!(drain(&mut changes), vec![UDI.to_string()]);
    }

    #[test]
    fn unmounted_device_has_unknown_size() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), false);
        let monitor = space_monitor(&backend, fixed());

        monitor.add_monitoring_device(UDI);

        assert_eq!(monitor.space(UDI), SpaceInfo::UNKNOWN);
        assert_eq!(monitor.full_size(UDI), None);
    }

    #[test]
    fn probe_failure_keeps_previous_value() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), false);
        let monitor = space_monitor(&backend, Arc::new(FailingProbe));
        monitor.add_monitoring_device(UDI);
        let mut changes = monitor.subscribe();

        backend.set_mount_point(UDI, "/run/media/user/USB");
        monitor.force_update_size(UDI);

        assert_eq!(monitor.space(UDI), SpaceInfo::UNKNOWN);
        assert!(drain(&mut changes).is_empty());
    }

    #[test]
    fn force_update_ignores_unknown_devices() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let monitor = space_monitor(&backend, fixed());

        monitor.force_update_size(UDI);

        assert_eq!(monitor.full_size(UDI), None);
    }

    #[test]
    fn removal_notifies_once() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let monitor = space_monitor(&backend, fixed());
        monitor.add_monitoring_device(UDI);
        let mut changes = monitor.subscribe();

        monitor.remove_monitoring_device(UDI);
        monitor.remove_monitoring_device(UDI);

        assert_eq!(drain(&mut changes), vec![UDI.to_string()]);
        assert_eq!(monitor.free_size(UDI), None);
    }

    #[test]
    fn state_change_of_unmonitored_device_drops_size() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let monitor = space_monitor(&backend, fixed());
        monitor.add_monitoring_device(UDI);

        monitor.on_state_changed(UDI);

        assert_eq!(monitor.full_size(UDI), None);
    }

    #[test]
    fn update_all_refreshes_known_devices() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), false);
        let monitor = space_monitor(&backend, fixed());
        monitor.add_monitoring_device(UDI);

        backend.set_accessible(UDI, true);
        monitor.update_all();

        assert_eq!(monitor.full_size(UDI), Some(8_000));
    }

    #[tokio::test]
    async fn follows_state_monitor_changes() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let monitor = space_monitor(&backend, fixed());
        let mut changes = monitor.subscribe();
        monitor.follow_state_changes();

        monitor.state_monitor.start_monitoring(UDI);

        let udi = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("size change in time")
            .expect("size change");
        assert_eq!(udi, UDI);
        assert_eq!(monitor.free_size(UDI), Some(3_000));
    }

    #[tokio::test]
    async fn visibility_toggles_refresher() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), false);
        let monitor = space_monitor(&backend, fixed());
        monitor.add_monitoring_device(UDI);
        backend.set_accessible(UDI, true);
        let mut changes = monitor.subscribe();

        monitor.set_visible(true);
        assert!(monitor.is_refreshing());
        tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("refresh in time")
            .expect("size change");
        assert_eq!(monitor.full_size(UDI), Some(8_000));

        monitor.set_visible(false);
        assert!(!monitor.is_refreshing());
    }

    /// Records the thread every statvfs sample ran on.
    #[derive(Default)]
    struct ThreadRecorder {
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl SpaceProbe for ThreadRecorder {
        fn probe(&self, mount_point: &str) -> Result<Usage> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(Usage {
                total: 1_000,
                available: 500,
                mount_point: mount_point.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn background_refresh_stats_on_blocking_pool() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), true);
        let recorder = Arc::new(ThreadRecorder::default());
        let monitor = space_monitor(&backend, recorder.clone());
        let mut changes = monitor.subscribe();
        monitor.follow_state_changes();

        monitor.state_monitor.start_monitoring(UDI);
        tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("size change in time")
            .expect("size change");

        let runtime_thread = std::thread::current().id();
        let threads = recorder.threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], runtime_thread);
        assert_eq!(monitor.free_size(UDI), Some(500));
    }

    #[tokio::test]
    async fn refresh_of_unmounted_device_is_unknown() {
        let backend = MockBackend::new();
        backend.add(UDI, storage_volume(true), false);
        let monitor = space_monitor(&backend, fixed());

        monitor.refresh_storage_space(UDI).await;

        assert_eq!(monitor.space(UDI), SpaceInfo::UNKNOWN);
    }
}
