// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use zbus::zvariant::{self, Value};
use zbus_macros::proxy;

#[proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2/Manager",
    interface = "org.freedesktop.UDisks2.Manager"
)]
pub trait UDisks2Manager {
    fn get_block_devices(
        &self,
        options: HashMap<String, Value<'_>>,
    ) -> zbus::Result<Vec<zvariant::OwnedObjectPath>>;

    /// Whether a check utility exists for the filesystem type.
    fn can_check(&self, type_: &str) -> zbus::Result<(bool, String)>;

    /// Whether a repair utility exists for the filesystem type.
    fn can_repair(&self, type_: &str) -> zbus::Result<(bool, String)>;
}

#[proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2",
    interface = "org.freedesktop.DBus.ObjectManager"
)]
pub trait UDisks2ObjectManager {
    #[zbus(signal)]
    fn interfaces_added(
        &self,
        object_path: zvariant::OwnedObjectPath,
        interfaces_and_properties: HashMap<String, HashMap<String, zvariant::OwnedValue>>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn interfaces_removed(
        &self,
        object_path: zvariant::OwnedObjectPath,
        interfaces: Vec<String>,
    ) -> zbus::Result<()>;
}
