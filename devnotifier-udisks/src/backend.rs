// SPDX-License-Identifier: GPL-3.0-only

//! [`DeviceBackend`] implementation on top of UDisks2

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use devnotifier_monitor::DeviceBackend;
use devnotifier_types::{DeviceCapabilities, DeviceEvent, ErrorCode, OperationInfo, OperationKind};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use udisks2::{drive::DriveProxy, filesystem::FilesystemProxy};
use zbus::{Connection, zvariant::Value};

use crate::dbus::{FILESYSTEM_IFACE, UDISKS2_SERVICE};
use crate::discovery::{DeviceSnapshot, mount_points_from, probe_device};
use crate::error::{BackendError, error_code_for};
use crate::jobs::{InFlight, JobFollower};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub(crate) type Snapshots = Arc<RwLock<HashMap<String, DeviceSnapshot>>>;

/// Device events produced by the backend, in the order they happened.
pub struct DeviceEventStream {
    receiver: mpsc::Receiver<(String, DeviceEvent)>,
}

impl DeviceEventStream {
    pub async fn recv(&mut self) -> Option<(String, DeviceEvent)> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<(String, DeviceEvent)> {
        self.receiver.try_recv().ok()
    }
}

/// UDisks2 device backend.
///
/// Queries are answered from a snapshot cache. [`Self::refresh`] fills it and
/// the watcher tasks keep mount points current. Operations started through
/// this type are reported as `Requested`/`Done` pairs on the event stream,
/// and so are the ones other clients start once [`Self::follow_jobs`] runs.
pub struct UDisksBackend {
    connection: Connection,
    runtime: Handle,
    snapshots: Snapshots,
    in_flight: InFlight,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    jobs: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::Sender<(String, DeviceEvent)>,
}

impl UDisksBackend {
    /// Connect to the system bus. Must be called inside a tokio runtime.
    pub async fn connect() -> Result<(Arc<Self>, DeviceEventStream), BackendError> {
        let connection = Connection::system()
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        Ok(Self::with_connection(connection))
    }

    pub fn with_connection(connection: Connection) -> (Arc<Self>, DeviceEventStream) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let backend = Arc::new(Self {
            connection,
            runtime: Handle::current(),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            watchers: Mutex::new(HashMap::new()),
            jobs: Mutex::new(None),
            events,
        });
        (backend, DeviceEventStream { receiver })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Re-read a device from UDisks2 and cache it.
    pub async fn refresh(&self, udi: &str) -> Result<DeviceSnapshot, BackendError> {
        refresh_snapshot(&self.connection, &self.snapshots, udi).await
    }

    /// Report mount, unmount, check, repair and eject jobs other clients
    /// start on cached devices. Replaces an earlier follower.
    pub async fn follow_jobs(&self) -> Result<(), BackendError> {
        let follower = JobFollower::subscribe(
            self.connection.clone(),
            self.snapshots.clone(),
            self.in_flight.clone(),
            self.events.clone(),
        )
        .await?;

        let task = self.runtime.spawn(follower.run());
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = jobs.replace(task) {
            previous.abort();
        }
        debug!("Following UDisks2 jobs");
        Ok(())
    }

    /// Drop a device that disappeared.
    pub fn forget(&self, udi: &str) {
        self.write_snapshots().remove(udi);
        self.unwatch(udi);
    }

    pub fn snapshot(&self, udi: &str) -> Option<DeviceSnapshot> {
        self.read_snapshots().get(udi).cloned()
    }

    pub async fn mount(&self, udi: &str) -> Result<OperationInfo, BackendError> {
        let filesystem = self.filesystem(udi, OperationKind::Mount).await?;
        self.run_operation(udi, OperationKind::Mount, async move {
            let opts: HashMap<&str, Value<'_>> = HashMap::new();
            filesystem.mount(opts).await.map(OperationInfo::Text)
        })
        .await
    }

    pub async fn unmount(&self, udi: &str) -> Result<OperationInfo, BackendError> {
        let filesystem = self.filesystem(udi, OperationKind::Unmount).await?;
        self.run_operation(udi, OperationKind::Unmount, async move {
            let opts: HashMap<&str, Value<'_>> = HashMap::new();
            filesystem.unmount(opts).await.map(|()| OperationInfo::Empty)
        })
        .await
    }

    /// Check the filesystem; the payload is `Bool(clean)`.
    pub async fn check(&self, udi: &str) -> Result<OperationInfo, BackendError> {
        let filesystem = self.filesystem(udi, OperationKind::Check).await?;
        self.run_operation(udi, OperationKind::Check, async move {
            let opts: HashMap<&str, Value<'_>> = HashMap::new();
            filesystem.check(opts).await.map(OperationInfo::Bool)
        })
        .await
    }

    pub async fn repair(&self, udi: &str) -> Result<OperationInfo, BackendError> {
        let filesystem = self.filesystem(udi, OperationKind::Repair).await?;
        self.run_operation(udi, OperationKind::Repair, async move {
            let opts: HashMap<&str, Value<'_>> = HashMap::new();
            filesystem.repair(opts).await.map(OperationInfo::Bool)
        })
        .await
    }

    pub async fn eject(&self, udi: &str) -> Result<OperationInfo, BackendError> {
        let drive_path = self
            .snapshot(udi)
            .filter(|s| s.capabilities.optical_drive)
            .and_then(|s| s.drive_path)
            .ok_or_else(|| BackendError::NotSupported {
                udi: udi.to_string(),
                operation: OperationKind::Eject,
            })?;

        let drive = DriveProxy::builder(&self.connection)
            .path(drive_path)?
            .build()
            .await?;
        self.run_operation(udi, OperationKind::Eject, async move {
            let opts: HashMap<&str, Value<'_>> = HashMap::new();
            drive.eject(opts).await.map(|()| OperationInfo::Empty)
        })
        .await
    }

    async fn filesystem(
        &self,
        udi: &str,
        operation: OperationKind,
    ) -> Result<FilesystemProxy<'static>, BackendError> {
        let snapshot = self
            .snapshot(udi)
            .ok_or_else(|| BackendError::DeviceNotFound(udi.to_string()))?;
        if !snapshot.capabilities.accepts_operation(operation) {
            return Err(BackendError::NotSupported {
                udi: udi.to_string(),
                operation,
            });
        }

        Ok(FilesystemProxy::builder(&self.connection)
            .path(udi.to_string())?
            .build()
            .await?)
    }

    /// Emit `Requested`, run the call, refresh the cache, emit `Done`.
    async fn run_operation<F>(
        &self,
        udi: &str,
        operation: OperationKind,
        call: F,
    ) -> Result<OperationInfo, BackendError>
    where
        F: Future<Output = udisks2::Result<OperationInfo>>,
    {
        let key = (udi.to_string(), operation);
        self.in_flight().insert(key.clone());

        info!("{operation} requested for {udi}");
        self.emit(udi, DeviceEvent::requested(operation)).await;

        let outcome = call.await;

        if let Err(e) = self.refresh(udi).await {
            debug!("Could not refresh {udi} after {operation}: {e}");
        }

        let (result, info) = done_payload(operation, &outcome);
        info!("{operation} finished for {udi}: {result}");
        self.emit(udi, DeviceEvent::done(operation, result, info))
            .await;
        self.in_flight().remove(&key);

        outcome.map_err(|e| BackendError::OperationFailed {
            udi: udi.to_string(),
            operation,
            code: error_code_for(&e),
            message: e.to_string(),
        })
    }

    async fn emit(&self, udi: &str, event: DeviceEvent) {
        if let Err(e) = self.events.send((udi.to_string(), event)).await {
            warn!("Device event receiver dropped: {e}");
        }
    }

    fn read_snapshots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceSnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_snapshots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeviceSnapshot>> {
        self.snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<(String, OperationKind)>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceBackend for UDisksBackend {
    fn is_valid(&self, udi: &str) -> bool {
        self.read_snapshots().contains_key(udi)
    }

    fn capabilities(&self, udi: &str) -> Option<DeviceCapabilities> {
        self.read_snapshots()
            .get(udi)
            .map(|s| s.capabilities.clone())
    }

    fn is_accessible(&self, udi: &str) -> bool {
        self.read_snapshots()
            .get(udi)
            .is_some_and(DeviceSnapshot::is_accessible)
    }

    fn mount_point(&self, udi: &str) -> Option<String> {
        self.read_snapshots()
            .get(udi)
            .and_then(|s| s.mount_point().map(str::to_string))
    }

    fn watch(&self, udi: &str, capabilities: &DeviceCapabilities) {
        if !capabilities.is_storage_volume() {
            return;
        }

        let mut watchers = self.watchers();
        if watchers.get(udi).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let task = self.runtime.spawn(follow_mount_points(
            self.connection.clone(),
            udi.to_string(),
            self.snapshots.clone(),
            self.events.clone(),
        ));
        watchers.insert(udi.to_string(), task);
        debug!("Watching mount points of {udi}");
    }

    fn unwatch(&self, udi: &str) {
        if let Some(task) = self.watchers().remove(udi) {
            task.abort();
            debug!("Stopped watching {udi}");
        }
    }
}

impl Drop for UDisksBackend {
    fn drop(&mut self) {
        let watchers = self
            .watchers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, task) in watchers.drain() {
            task.abort();
        }

        let jobs = self
            .jobs
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = jobs.take() {
            task.abort();
        }
    }
}

/// Re-read a device from UDisks2 into the cache.
pub(crate) async fn refresh_snapshot(
    connection: &Connection,
    snapshots: &Snapshots,
    udi: &str,
) -> Result<DeviceSnapshot, BackendError> {
    let snapshot = probe_device(connection, udi).await?;
    snapshots
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(udi.to_string(), snapshot.clone());
    Ok(snapshot)
}

/// Result code and payload of the `Done` event for a finished call.
fn done_payload(
    operation: OperationKind,
    outcome: &udisks2::Result<OperationInfo>,
) -> (ErrorCode, OperationInfo) {
    match outcome {
        // A repair that ran but could not fix the filesystem is a failure.
        Ok(OperationInfo::Bool(false)) if operation == OperationKind::Repair => {
            (ErrorCode::OperationFailed, OperationInfo::Bool(false))
        }
        Ok(info) => (ErrorCode::Success, info.clone()),
        Err(e) => (error_code_for(e), OperationInfo::Empty),
    }
}

/// Report mount point changes of one filesystem as accessibility events.
async fn follow_mount_points(
    connection: Connection,
    udi: String,
    snapshots: Snapshots,
    events: mpsc::Sender<(String, DeviceEvent)>,
) {
    if let Err(e) = follow_mount_points_inner(&connection, &udi, &snapshots, &events).await {
        warn!("Stopped following mount points of {udi}: {e}");
    }
}

async fn follow_mount_points_inner(
    connection: &Connection,
    udi: &str,
    snapshots: &Snapshots,
    events: &mpsc::Sender<(String, DeviceEvent)>,
) -> Result<(), BackendError> {
    let properties = zbus::fdo::PropertiesProxy::builder(connection)
        .destination(UDISKS2_SERVICE)?
        .path(udi.to_string())?
        .build()
        .await?;
    let filesystem = FilesystemProxy::builder(connection)
        .path(udi.to_string())?
        .build()
        .await?;
    let mut changes = properties.receive_properties_changed().await?;

    while let Some(signal) = changes.next().await {
        let is_filesystem = match signal.args() {
            Ok(args) => args.interface_name.as_str() == FILESYSTEM_IFACE,
            Err(e) => {
                warn!("Failed to parse PropertiesChanged signal args: {e}");
                continue;
            }
        };
        if !is_filesystem {
            continue;
        }

        let mount_points = mount_points_from(&filesystem.mount_points().await.unwrap_or_default());
        let accessible = !mount_points.is_empty();

        {
            let mut snapshots = snapshots
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(snapshot) = snapshots.get_mut(udi) {
                snapshot.mount_points = mount_points;
            }
        }

        debug!("{udi} accessibility: {accessible}");
        if events
            .send((udi.to_string(), DeviceEvent::AccessibilityChanged { accessible }))
            .await
            .is_err()
        {
            break;
        }
    }

    Ok(())
}
