// SPDX-License-Identifier: GPL-3.0-only

//! Operations started by other UDisks2 clients, seen through their Job objects.
//!
//! A job announces itself with `InterfacesAdded` carrying its `Operation` and
//! `Objects` properties and finishes with a `Completed(success, message)`
//! signal. Both are reported as `Requested`/`Done` events for the tracked
//! block objects the job works on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use devnotifier_types::{DeviceEvent, ErrorCode, OperationInfo, OperationKind};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::message::Type as MessageType;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{Connection, MatchRule, MessageStream};

use crate::backend::{Snapshots, refresh_snapshot};
use crate::dbus::proxies::{InterfacesAddedStream, UDisks2ObjectManagerProxy};
use crate::discovery::DeviceSnapshot;
use crate::error::BackendError;

pub(crate) const JOB_IFACE: &str = "org.freedesktop.UDisks2.Job";
const JOBS_PATH: &str = "/org/freedesktop/UDisks2/jobs";

/// Operations this process is running itself, keyed by block object.
pub(crate) type InFlight = Arc<Mutex<HashSet<(String, OperationKind)>>>;

/// Operation reported for a UDisks2 job id, if it is one we follow.
pub(crate) fn operation_kind_for_job(operation: &str) -> Option<OperationKind> {
    match operation {
        "filesystem-mount" => Some(OperationKind::Mount),
        "filesystem-unmount" => Some(OperationKind::Unmount),
        "filesystem-check" => Some(OperationKind::Check),
        "filesystem-repair" => Some(OperationKind::Repair),
        "drive-eject" => Some(OperationKind::Eject),
        _ => None,
    }
}

/// Cached block objects a job works on. Eject jobs name the drive instead.
pub(crate) fn blocks_for_job(
    kind: OperationKind,
    objects: &[String],
    snapshots: &HashMap<String, DeviceSnapshot>,
) -> Vec<String> {
    let mut blocks: Vec<String> = match kind {
        OperationKind::Eject => snapshots
            .iter()
            .filter(|(_, s)| s.drive_path.as_ref().is_some_and(|d| objects.contains(d)))
            .map(|(udi, _)| udi.clone())
            .collect(),
        _ => objects
            .iter()
            .filter(|o| snapshots.contains_key(o.as_str()))
            .cloned()
            .collect(),
    };
    blocks.sort();
    blocks
}

/// Result code and payload of the `Done` event for a completed job.
///
/// A job only says whether it succeeded, so check and repair results are
/// that flag.
pub(crate) fn job_done_payload(
    kind: OperationKind,
    success: bool,
    mount_point: Option<&str>,
) -> (ErrorCode, OperationInfo) {
    let result = if success {
        ErrorCode::Success
    } else {
        ErrorCode::OperationFailed
    };

    let info = match kind {
        OperationKind::Check | OperationKind::Repair => OperationInfo::Bool(success),
        OperationKind::Mount if success => mount_point
            .map(|mp| OperationInfo::Text(mp.to_string()))
            .unwrap_or_default(),
        _ => OperationInfo::Empty,
    };

    (result, info)
}

/// `Operation` and `Objects` of a job from its `InterfacesAdded` properties.
fn job_properties(properties: &HashMap<String, OwnedValue>) -> Option<(String, Vec<String>)> {
    let operation = properties
        .get("Operation")
        .and_then(|v| <&str>::try_from(v).ok())?
        .to_string();
    let objects = properties
        .get("Objects")
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| Vec::<OwnedObjectPath>::try_from(v).ok())
        .unwrap_or_default();

    Some((operation, objects.into_iter().map(|p| p.to_string()).collect()))
}

struct PendingJob {
    kind: OperationKind,
    blocks: Vec<String>,
}

pub(crate) struct JobFollower {
    connection: Connection,
    snapshots: Snapshots,
    in_flight: InFlight,
    events: mpsc::Sender<(String, DeviceEvent)>,
    added: InterfacesAddedStream,
    completed: MessageStream,
    pending: HashMap<String, PendingJob>,
}

impl JobFollower {
    pub(crate) async fn subscribe(
        connection: Connection,
        snapshots: Snapshots,
        in_flight: InFlight,
        events: mpsc::Sender<(String, DeviceEvent)>,
    ) -> Result<Self, BackendError> {
        let object_manager = UDisks2ObjectManagerProxy::new(&connection).await?;
        let added = object_manager.receive_interfaces_added().await?;

        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(JOB_IFACE)?
            .member("Completed")?
            .path_namespace(JOBS_PATH)?
            .build();
        let completed = MessageStream::for_match_rule(rule, &connection, None).await?;

        Ok(Self {
            connection,
            snapshots,
            in_flight,
            events,
            added,
            completed,
            pending: HashMap::new(),
        })
    }

    pub(crate) async fn run(mut self) {
        loop {
            // A job's InterfacesAdded always precedes its Completed on the bus.
            tokio::select! {
                biased;
                Some(signal) = self.added.next() => {
                    let job = match signal.args() {
                        Ok(args) => args
                            .interfaces_and_properties
                            .get(JOB_IFACE)
                            .and_then(job_properties)
                            .map(|(operation, objects)| (args.object_path.to_string(), operation, objects)),
                        Err(e) => {
                            warn!("Failed to parse InterfacesAdded signal args: {e}");
                            None
                        }
                    };
                    if let Some((job_path, operation, objects)) = job {
                        self.job_added(job_path, &operation, &objects).await;
                    }
                }
                Some(message) = self.completed.next() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Failed to receive job completion: {e}");
                            continue;
                        }
                    };
                    let Some(job_path) = message.header().path().map(|p| p.to_string()) else {
                        continue;
                    };
                    match message.body().deserialize::<(bool, String)>() {
                        Ok((success, _)) => self.job_completed(&job_path, success).await,
                        Err(e) => warn!("Failed to parse Completed signal of {job_path}: {e}"),
                    }
                }
                else => break,
            }

            if self.events.is_closed() {
                break;
            }
        }
        debug!("Stopped following UDisks2 jobs");
    }

    async fn job_added(&mut self, job_path: String, operation: &str, objects: &[String]) {
        let Some(kind) = operation_kind_for_job(operation) else {
            debug!("Ignoring {operation} job {job_path}");
            return;
        };

        let blocks: Vec<String> = {
            let snapshots = self
                .snapshots
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            blocks_for_job(kind, objects, &snapshots)
                .into_iter()
                .filter(|udi| !in_flight.contains(&(udi.clone(), kind)))
                .collect()
        };
        if blocks.is_empty() {
            return;
        }

        for udi in &blocks {
            info!("{kind} started on {udi} by another client");
            self.emit(udi, DeviceEvent::requested(kind)).await;
        }
        self.pending.insert(job_path, PendingJob { kind, blocks });
    }

    async fn job_completed(&mut self, job_path: &str, success: bool) {
        let Some(job) = self.pending.remove(job_path) else {
            return;
        };

        for udi in &job.blocks {
            let mount_point = match refresh_snapshot(&self.connection, &self.snapshots, udi).await {
                Ok(snapshot) => snapshot.mount_point().map(str::to_string),
                Err(e) => {
                    debug!("Could not refresh {udi} after {} job: {e}", job.kind);
                    None
                }
            };

            let (result, info) = job_done_payload(job.kind, success, mount_point.as_deref());
            info!("{} finished on {udi}: {result}", job.kind);
            self.emit(udi, DeviceEvent::done(job.kind, result, info)).await;
        }
    }

    async fn emit(&self, udi: &str, event: DeviceEvent) {
        if let Err(e) = self.events.send((udi.to_string(), event)).await {
            warn!("Device event receiver dropped: {e}");
        }
    }
}
