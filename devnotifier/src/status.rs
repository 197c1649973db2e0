// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use devnotifier_monitor::{ActionKind, DevicesStateMonitor, SpaceMonitor};
use devnotifier_types::{SpaceInfo, bytes_to_pretty};
use devnotifier_udisks::UDisksBackend;
use serde::Serialize;

use crate::config::Config;
use crate::devices::Session;

/// One line of `devnotifier status`.
///
/// Only facts read from UDisks2 are reported. Busy state and check results
/// belong to the running `watch` process and are not visible here.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DeviceReport {
    pub udi: String,
    pub name: String,
    pub device: String,
    pub removable: bool,
    pub mounted: bool,
    pub mount_point: Option<String>,
    pub space: SpaceInfo,
    pub actions: Vec<&'static str>,
}

impl DeviceReport {
    pub fn collect(
        backend: &UDisksBackend,
        monitor: &DevicesStateMonitor,
        space: &SpaceMonitor,
        udi: &str,
    ) -> Option<Self> {
        if !monitor.is_monitored(udi) {
            return None;
        }
        let snapshot = backend.snapshot(udi).unwrap_or_default();

        Some(Self {
            udi: udi.to_string(),
            name: snapshot.display_name().to_string(),
            device: snapshot.device.clone(),
            removable: monitor.is_removable(udi),
            mounted: monitor.is_mounted(udi),
            mount_point: snapshot.mount_point().map(str::to_string),
            space: space.space(udi),
            actions: ActionKind::valid_for(monitor, udi)
                .into_iter()
                .map(ActionKind::name)
                .collect(),
        })
    }

    pub fn to_line(&self) -> String {
        let mut line = format!("{:<12} {:<16}", self.device, self.name);
        line.push_str(if self.removable { " removable" } else { " internal" });

        match &self.mount_point {
            Some(mount_point) => line.push_str(&format!(", mounted at {mount_point}")),
            None if self.mounted => line.push_str(", mounted"),
            None => line.push_str(", not mounted"),
        }

        if let (Some(total), Some(available)) = (self.space.total, self.space.available) {
            line.push_str(&format!(
                ", {} free of {}",
                bytes_to_pretty(&available, false),
                bytes_to_pretty(&total, false)
            ));
        }

        if !self.actions.is_empty() {
            line.push_str(&format!(" [{}]", self.actions.join(", ")));
        }

        line
    }
}

pub(crate) async fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let session = Session::connect().await?;
    session.track_existing(config.filter).await?;

    let space = SpaceMonitor::acquire(
        session.monitor.clone(),
        Duration::from_secs(config.space_refresh_secs),
    );
    let devices = session.monitor.monitored_devices_newest_first();
    for udi in &devices {
        space.refresh_storage_space(udi).await;
    }

    let reports: Vec<DeviceReport> = devices
        .iter()
        .filter_map(|udi| DeviceReport::collect(&session.backend, &session.monitor, &space, udi))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("No devices");
    } else {
        for report in &reports {
            println!("{}", report.to_line());
        }
    }

    Ok(())
}
