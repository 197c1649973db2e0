// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the device notifier
//!
//! These types are shared by every layer of the stack:
//!
//! - **devnotifier-monitor**: keeps one [`DeviceStatus`] per monitored device
//! - **devnotifier-udisks**: produces [`DeviceEvent`]s and [`DeviceCapabilities`]
//! - **devnotifier**: prints them and serializes them for `status --json`
//!
//! A device is always named by its identifier (udi), an opaque string that is
//! stable for the lifetime of the device. With the UDisks2 backend this is the
//! block object path.

pub mod capabilities;
pub mod event;
pub mod operation;
pub mod space;
pub mod status;

pub use capabilities::{DeviceCapabilities, DeviceKind, DriveFlags};
pub use event::DeviceEvent;
pub use operation::{ErrorCode, OperationInfo, OperationKind};
pub use space::{SpaceInfo, Usage, bytes_to_pretty};
pub use status::{DeviceState, DeviceStatus};
