// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use devnotifier_monitor::{DevicesStateMonitor, SpaceMonitor};
use devnotifier_udisks::{HotplugEvent, HotplugEventStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::devices::Session;

/// Follow device changes until interrupted.
pub(crate) async fn run(config: &Config) -> anyhow::Result<()> {
    let mut session = Session::connect().await?;
    let mut hotplug = HotplugEventStream::new(session.backend.connection()).await?;

    let space = SpaceMonitor::acquire(
        session.monitor.clone(),
        Duration::from_secs(config.space_refresh_secs),
    );
    space.follow_state_changes();

    let mut changes = session.monitor.subscribe();
    let mut space_changes = space.subscribe();

    let tracked = session.track_existing(config.filter).await?;
    info!("Watching {tracked} device(s)");
    if let Err(e) = session.backend.follow_jobs().await {
        warn!("Operations started by other programs will not be reported: {e}");
    }
    space.set_visible(true);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                info!("Shutting down");
                break;
            }
            Some((udi, event)) = session.events.recv() => {
                debug!("{udi}: {event:?}");
                session.monitor.handle_event(&udi, &event);
            }
            Some(hotplug_event) = hotplug.recv() => match hotplug_event {
                HotplugEvent::Added(udi) => {
                    session.track(&udi, config.filter).await;
                }
                HotplugEvent::Removed(udi) => session.untrack(&udi),
            },
            changed = changes.recv() => match changed {
                Ok(udi) => log_state_change(&session.monitor, &udi),
                Err(RecvError::Lagged(missed)) => warn!("Missed {missed} device state changes"),
                Err(RecvError::Closed) => break,
            },
            changed = space_changes.recv() => match changed {
                Ok(udi) => {
                    let info = space.space(&udi);
                    debug!(udi = %udi, total = ?info.total, available = ?info.available, "Free space changed");
                }
                Err(RecvError::Lagged(missed)) => debug!("Missed {missed} free space changes"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    space.set_visible(false);
    Ok(())
}

fn log_state_change(monitor: &DevicesStateMonitor, udi: &str) {
    let Some(status) = monitor.status(udi) else {
        info!(udi = %udi, "Device no longer monitored");
        return;
    };

    info!(
        udi = %udi,
        state = %status.state,
        busy = status.busy,
        mounted = status.mounted,
        needs_repair = status.needs_repair,
        result = %status.last_operation_result,
        "Device state changed"
    );
}
