//! Unmounting and powering off media drives before a destructive operation.

use std::fs;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, warn};

use crate::error::MountError;
use crate::inventory::Drive;
use crate::runner::CommandRunner;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_SPACING: Duration = Duration::from_secs(1);
const SETTLE_DELAY: Duration = Duration::from_millis(500);

pub(crate) fn mounted_paths() -> Vec<String> {
    fs::read_to_string("/proc/mounts")
        .map(|contents| {
            contents
                .lines()
                .filter_map(|line| line.split_whitespace().nth(1))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn still_mounted(drive: &Drive) -> Vec<std::path::PathBuf> {
    let proc_mounts = mounted_paths();
    drive
        .active_mountpoints()
        .into_iter()
        .filter(|mp| {
            mp.to_str()
                .is_some_and(|s| proc_mounts.iter().any(|m| m == s))
        })
        .collect()
}

/// Unmounts every partition of `drive`.
///
/// Returns `(unmounted_cleanly, needed_lazy_unmount)`. Idempotent: a drive
/// with nothing mounted returns `(true, false)` immediately without running
/// any commands.
pub fn unmount_device(drive: &Drive, raise_on_failure: bool) -> Result<(bool, bool), MountError> {
    if drive.active_mountpoints().is_empty() {
        return Ok((true, false));
    }

    let _ = CommandRunner::run_checked(&["sync"], None);
    sleep(SETTLE_DELAY);

    for attempt in 1..=RETRY_ATTEMPTS {
        let remaining = still_mounted(drive);
        if remaining.is_empty() {
            return Ok((true, false));
        }
        debug!("unmount attempt {attempt}/{RETRY_ATTEMPTS} for {}", drive.name);
        for part in &drive.partitions {
            if part.mountpoint.is_some() {
                let _ = CommandRunner::run_checked(&["umount", &part_path(&drive.name, part)], None);
            }
        }
        if attempt < RETRY_ATTEMPTS {
            sleep(RETRY_SPACING);
        }
    }

    if still_mounted(drive).is_empty() {
        return Ok((true, false));
    }

    warn!("plain umount failed for {}, attempting lazy unmount", drive.name);
    for part in &drive.partitions {
        if part.mountpoint.is_some() {
            let _ = CommandRunner::run_checked(
                &["umount", "-l", &part_path(&drive.name, part)],
                None,
            );
        }
    }

    let remaining = still_mounted(drive);
    if remaining.is_empty() {
        Ok((true, true))
    } else if raise_on_failure {
        Err(MountError::UnmountFailed {
            device: drive.name.clone(),
            remaining,
        })
    } else {
        Ok((false, true))
    }
}

fn part_path(_drive_name: &str, part: &crate::inventory::Partition) -> String {
    part.path.to_string_lossy().into_owned()
}

/// Attempts to spin down and power off `drive` via udisksctl, falling back
/// to `hdparm`. Returns true if either succeeded.
pub fn power_off_device(drive: &Drive) -> bool {
    let path = drive.path.to_string_lossy();
    if CommandRunner::run_checked(&["udisksctl", "power-off", "-b", &path], None).is_ok() {
        return true;
    }
    CommandRunner::run_checked(&["hdparm", "-Y", &path], None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{PartitionTable, Transport};

    fn unmounted_drive() -> Drive {
        Drive {
            name: "sdb".into(),
            path: "/dev/sdb".into(),
            size_bytes: 1000,
            rotational: false,
            removable: true,
            transport: Transport::Usb,
            vendor: None,
            model: None,
            serial: None,
            table: PartitionTable::Gpt,
            partitions: vec![],
        }
    }

    #[test]
    fn unmount_is_idempotent_with_nothing_mounted() {
        let drive = unmounted_drive();
        let (ok, lazy) = unmount_device(&drive, true).unwrap();
        assert!(ok);
        assert!(!lazy);
    }
}
