// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use std::{ffi::CString, mem::MaybeUninit};

use devnotifier_types::Usage;

/// Size and free space of the filesystem mounted at `mount_point`.
pub fn usage_for_mount_point(mount_point: &str) -> Result<Usage> {
    let mount_point_c = CString::new(mount_point)
        .with_context(|| format!("mount point contains NUL byte: {mount_point:?}"))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(mount_point_c.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for mount point {mount_point:?}"));
    }

    let stat = unsafe { stat.assume_init() };
    let frsize = if stat.f_frsize > 0 {
        stat.f_frsize
    } else {
        stat.f_bsize
    };

    let total = (stat.f_blocks as u64).saturating_mul(frsize as u64);
    let available = (stat.f_bavail as u64).saturating_mul(frsize as u64);

    Ok(Usage {
        total,
        available,
        mount_point: mount_point.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_filesystem_has_size() {
        let usage = usage_for_mount_point("/").expect("statvfs on /");
        assert!(usage.total > 0);
        assert!(usage.available <= usage.total);
    }

    #[test]
    fn missing_mount_point_fails() {
        assert!(usage_for_mount_point("/definitely/not/a/mount/point").is_err());
        assert!(usage_for_mount_point("bad\0path").is_err());
    }
}
