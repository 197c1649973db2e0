// SPDX-License-Identifier: GPL-3.0-only

pub(crate) mod proxies;

pub(crate) const UDISKS2_SERVICE: &str = "org.freedesktop.UDisks2";
pub(crate) const BLOCK_IFACE: &str = "org.freedesktop.UDisks2.Block";
pub(crate) const FILESYSTEM_IFACE: &str = "org.freedesktop.UDisks2.Filesystem";
