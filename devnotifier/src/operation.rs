// SPDX-License-Identifier: GPL-3.0-only

use devnotifier_monitor::{ActionKind, DevicesStateMonitor};
use devnotifier_types::{OperationInfo, OperationKind};
use devnotifier_udisks::{BackendError, UDisksBackend, object_path_for};
use tracing::{info, warn};

use crate::config::{Config, DeviceFilter};
use crate::devices::Session;

/// Action whose validity covers the operation, if any.
pub(crate) fn action_for(kind: OperationKind) -> Option<ActionKind> {
    match kind {
        OperationKind::Check => Some(ActionKind::Check),
        OperationKind::Unmount | OperationKind::Eject => Some(ActionKind::Unmount),
        OperationKind::Mount | OperationKind::Repair => None,
    }
}

pub(crate) fn describe(kind: OperationKind, info: &OperationInfo) -> Option<String> {
    match (kind, info) {
        (OperationKind::Mount, OperationInfo::Text(mount_point)) => {
            Some(format!("mounted at {mount_point}"))
        }
        (OperationKind::Check, OperationInfo::Bool(true)) => Some("filesystem is clean".to_string()),
        (OperationKind::Check, OperationInfo::Bool(false)) => {
            Some("filesystem needs repair".to_string())
        }
        (OperationKind::Repair, OperationInfo::Bool(true)) => Some("filesystem repaired".to_string()),
        (OperationKind::Repair, OperationInfo::Bool(false)) => {
            Some("filesystem could not be repaired".to_string())
        }
        _ => None,
    }
}

async fn start(
    kind: OperationKind,
    backend: &UDisksBackend,
    udi: &str,
) -> Result<OperationInfo, BackendError> {
    match kind {
        OperationKind::Mount => backend.mount(udi).await,
        OperationKind::Unmount => backend.unmount(udi).await,
        OperationKind::Check => backend.check(udi).await,
        OperationKind::Repair => backend.repair(udi).await,
        OperationKind::Eject => backend.eject(udi).await,
    }
}

fn warn_if_not_offered(kind: OperationKind, monitor: &DevicesStateMonitor, udi: &str) {
    if let Some(action) = action_for(kind)
        && !action.is_valid(monitor, udi)
    {
        warn!("{action} is not currently offered for {udi}, trying anyway");
    }
}

/// Run one operation on a device and report the outcome.
pub(crate) async fn run(kind: OperationKind, id: &str) -> anyhow::Result<()> {
    let mut session = Session::connect().await?;
    let udi = object_path_for(id);

    if !session.track(&udi, DeviceFilter::All).await {
        anyhow::bail!("{id} is not a known storage device");
    }
    warn_if_not_offered(kind, &session.monitor, &udi);

    run_on(&mut session, kind, id, &udi).await
}

/// Unmount every tracked device that offers it, newest first.
pub(crate) async fn run_unmount_all(config: &Config) -> anyhow::Result<()> {
    let mut session = Session::connect().await?;
    session.track_existing(config.filter).await?;

    let targets = ActionKind::Unmount.offered_devices(&session.monitor);
    if targets.is_empty() {
        println!("Nothing to unmount");
        return Ok(());
    }
    info!("Unmounting {} device(s)", targets.len());

    let mut failed = 0;
    for udi in &targets {
        let id = session
            .backend
            .snapshot(udi)
            .map(|s| s.device)
            .filter(|device| !device.is_empty())
            .unwrap_or_else(|| udi.clone());
        if let Err(e) = run_on(&mut session, OperationKind::Unmount, &id, udi).await {
            warn!("Unmounting {id} failed: {e:#}");
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} device(s) could not be unmounted", targets.len());
    }
    Ok(())
}

async fn run_on(
    session: &mut Session,
    kind: OperationKind,
    id: &str,
    udi: &str,
) -> anyhow::Result<()> {
    let operation = start(kind, &session.backend, udi);
    tokio::pin!(operation);

    let outcome = loop {
        tokio::select! {
            biased;
            Some((event_udi, event)) = session.events.recv() => {
                session.monitor.handle_event(&event_udi, &event);
            }
            outcome = &mut operation => break outcome,
        }
    };
    while let Some((event_udi, event)) = session.events.try_recv() {
        session.monitor.handle_event(&event_udi, &event);
    }

    let state = session.monitor.state(udi);
    match outcome {
        Ok(info) => {
            match describe(kind, &info) {
                Some(detail) => println!("{id}: {kind} done ({state}), {detail}"),
                None => println!("{id}: {kind} done ({state})"),
            }
            if kind == OperationKind::Check && session.monitor.needs_repair(udi) {
                println!("{id}: run `devnotifier repair {id}` to fix it");
            }
            let result = session.monitor.operation_result(udi);
            if !result.is_success() {
                anyhow::bail!("{kind} on {id} finished with {result}");
            }
            Ok(())
        }
        Err(e) => {
            println!("{id}: {kind} failed: {}", e.code());
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eject_is_gated_like_unmount() {
        assert_eq!(action_for(OperationKind::Eject), Some(ActionKind::Unmount));
        assert_eq!(action_for(OperationKind::Check), Some(ActionKind::Check));
        assert_eq!(action_for(OperationKind::Mount), None);
    }

    #[test]
    fn describes_operation_payloads() {
        assert_eq!(
            describe(OperationKind::Mount, &OperationInfo::Text("/run/media/user/A".to_string())),
            Some("mounted at /run/media/user/A".to_string())
        );
        assert_eq!(
            describe(OperationKind::Check, &OperationInfo::Bool(false)),
            Some("filesystem needs repair".to_string())
        );
        assert_eq!(describe(OperationKind::Unmount, &OperationInfo::Empty), None);
    }
}
