// SPDX-License-Identifier: GPL-3.0-only

//! Device state tracking for removable storage
//!
//! [`DevicesStateMonitor`] keeps one [`DeviceStatus`] per monitored device
//! and turns [`DeviceEvent`]s from a [`DeviceBackend`] into state transitions.
//! [`SpaceMonitor`] follows its change notifications to keep filesystem sizes
//! up to date, and [`actions`] derives which user actions are offered.

pub mod actions;
pub mod backend;
pub mod registry;
pub mod space;
pub mod state;
pub mod usage;

#[cfg(test)]
pub(crate) mod mock;

pub use actions::ActionKind;
pub use backend::DeviceBackend;
pub use registry::SharedInstance;
pub use space::{SpaceMonitor, SpaceProbe, StatvfsProbe};
pub use state::{DevicesStateMonitor, TransitionContext, transition};
pub use usage::usage_for_mount_point;

pub use devnotifier_types::{
    DeviceCapabilities, DeviceEvent, DeviceState, DeviceStatus, ErrorCode, OperationInfo,
    OperationKind, SpaceInfo,
};
