// SPDX-License-Identifier: GPL-3.0-only

//! Block objects appearing and disappearing on the UDisks2 object tree

use futures::StreamExt;
use tracing::warn;
use zbus::Connection;

use crate::dbus::proxies::{
    InterfacesAddedStream, InterfacesRemovedStream, UDisks2ObjectManagerProxy,
};
use crate::dbus::{BLOCK_IFACE, FILESYSTEM_IFACE};
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A block object appeared, or gained a filesystem
    Added(String),
    Removed(String),
}

/// Classify an `InterfacesAdded` signal.
///
/// A filesystem showing up on an existing block object counts as `Added`
/// so its capabilities get probed again.
fn added_event<'a>(
    object_path: &str,
    mut interfaces: impl Iterator<Item = &'a str>,
) -> Option<HotplugEvent> {
    interfaces
        .any(|iface| iface == BLOCK_IFACE || iface == FILESYSTEM_IFACE)
        .then(|| HotplugEvent::Added(object_path.to_string()))
}

/// Classify an `InterfacesRemoved` signal. Only a lost Block interface
/// means the device is gone.
fn removed_event<'a>(
    object_path: &str,
    mut interfaces: impl Iterator<Item = &'a str>,
) -> Option<HotplugEvent> {
    interfaces
        .any(|iface| iface == BLOCK_IFACE)
        .then(|| HotplugEvent::Removed(object_path.to_string()))
}

/// Hotplug notifications read straight off the ObjectManager signals.
pub struct HotplugEventStream {
    added: InterfacesAddedStream,
    removed: InterfacesRemovedStream,
}

impl HotplugEventStream {
    pub async fn new(connection: &Connection) -> Result<Self, BackendError> {
        let object_manager = UDisks2ObjectManagerProxy::new(connection).await?;
        Ok(Self {
            added: object_manager.receive_interfaces_added().await?,
            removed: object_manager.receive_interfaces_removed().await?,
        })
    }

    /// Next block device change. `None` once the bus connection is gone.
    pub async fn recv(&mut self) -> Option<HotplugEvent> {
        loop {
            let event = tokio::select! {
                Some(signal) = self.added.next() => match signal.args() {
                    Ok(args) => added_event(
                        args.object_path.as_str(),
                        args.interfaces_and_properties.keys().map(String::as_str),
                    ),
                    Err(e) => {
                        warn!("Failed to parse InterfacesAdded signal args: {e}");
                        None
                    }
                },
                Some(signal) = self.removed.next() => match signal.args() {
                    Ok(args) => removed_event(
                        args.object_path.as_str(),
                        args.interfaces.iter().map(String::as_str),
                    ),
                    Err(e) => {
                        warn!("Failed to parse InterfacesRemoved signal args: {e}");
                        None
                    }
                },
                else => return None,
            };

            if event.is_some() {
                return event;
            }
        }
    }
}
