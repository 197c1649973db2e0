// SPDX-License-Identifier: GPL-3.0-only

mod dbus;
mod jobs;

pub mod backend;
pub mod discovery;
pub mod error;
pub mod hotplug;

pub use backend::{DeviceEventStream, UDisksBackend};
pub use discovery::{DeviceSnapshot, list_block_devices, object_path_for, probe_device};
pub use error::{BackendError, error_code_for};
pub use hotplug::{HotplugEvent, HotplugEventStream};

pub use zbus::Connection;
