// SPDX-License-Identifier: GPL-3.0-only

use devnotifier_types::DeviceCapabilities;

/// Hardware abstraction the monitors query.
///
/// All calls are synchronous and expected to be cheap: implementations answer
/// from a cache that they keep current on their own. Unknown identifiers must
/// not panic; they report `false`/`None`.
pub trait DeviceBackend: Send + Sync {
    /// Whether the device still exists.
    fn is_valid(&self, udi: &str) -> bool;

    /// Capability descriptor for the device, `None` if it is unknown.
    fn capabilities(&self, udi: &str) -> Option<DeviceCapabilities>;

    /// Whether the device's filesystem is currently mounted.
    fn is_accessible(&self, udi: &str) -> bool;

    /// Where the filesystem is mounted, if it is.
    fn mount_point(&self, udi: &str) -> Option<String>;

    /// Start delivering events for the device.
    fn watch(&self, udi: &str, capabilities: &DeviceCapabilities);

    /// Stop delivering events for the device.
    fn unwatch(&self, udi: &str);
}
