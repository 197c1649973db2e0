// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use devnotifier_monitor::DevicesStateMonitor;
use devnotifier_types::DeviceCapabilities;
use devnotifier_udisks::{DeviceEventStream, UDisksBackend, list_block_devices};
use tracing::{debug, info};

use crate::config::DeviceFilter;

/// Backend connection plus the process wide state monitor.
pub(crate) struct Session {
    pub backend: Arc<UDisksBackend>,
    pub events: DeviceEventStream,
    pub monitor: Arc<DevicesStateMonitor>,
}

impl Session {
    pub async fn connect() -> anyhow::Result<Self> {
        let (backend, events) = UDisksBackend::connect().await?;
        let monitor = DevicesStateMonitor::acquire(backend.clone());
        Ok(Self {
            backend,
            events,
            monitor,
        })
    }

    /// Probe a block object and start or stop monitoring it accordingly.
    ///
    /// Returns whether the device is monitored afterwards.
    pub async fn track(&self, udi: &str, filter: DeviceFilter) -> bool {
        let snapshot = match self.backend.refresh(udi).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Skipping {udi}: {e}");
                return false;
            }
        };

        if !should_track(&snapshot.capabilities, filter) {
            if self.monitor.is_monitored(udi) {
                self.monitor.stop_monitoring(udi);
            }
            return false;
        }

        // Capabilities are fixed for a monitoring session, so start over when
        // UDisks2 reports new ones (e.g. a filesystem appeared).
        if self
            .monitor
            .capabilities(udi)
            .is_some_and(|known| known != snapshot.capabilities)
        {
            debug!("Capabilities of {udi} changed, restarting monitoring");
            self.monitor.stop_monitoring(udi);
        }

        if !self.monitor.is_monitored(udi) {
            info!("Monitoring {} ({udi})", snapshot.display_name());
        }
        self.monitor.start_monitoring(udi);
        true
    }

    pub fn untrack(&self, udi: &str) {
        if self.monitor.is_monitored(udi) {
            info!("{udi} removed");
            self.monitor.stop_monitoring(udi);
        }
        self.backend.forget(udi);
    }

    /// Start monitoring every block object that is already present.
    pub async fn track_existing(&self, filter: DeviceFilter) -> anyhow::Result<usize> {
        let mut tracked = 0;
        for udi in list_block_devices(self.backend.connection()).await? {
            if self.track(&udi, filter).await {
                tracked += 1;
            }
        }
        Ok(tracked)
    }
}

pub(crate) fn should_track(capabilities: &DeviceCapabilities, filter: DeviceFilter) -> bool {
    !capabilities.kinds.is_empty() && filter.accepts(capabilities.is_removable())
}
