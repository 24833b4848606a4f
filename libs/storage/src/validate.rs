//! Pre-flight checks shared by the clone, erase, and format engines.
//!
//! Every destructive operation runs its validator before touching a device;
//! ordering matters (existence, then identity, then mount state, then
//! space) so the error a caller sees is always the most fundamental one.

use crate::error::{CloneError, DeviceError, MountError, StorageError};
use crate::inventory::{base_device, Drive, DriveClass, Inventory};
use crate::unmount::still_mounted;

/// Re-reads `/proc/mounts` rather than trusting the cached lsblk snapshot,
/// since inventory-reported mountpoints can go stale between a scan and a
/// destructive operation.
fn require_unmounted(drive: &Drive) -> Result<(), MountError> {
    let mounted = still_mounted(drive);
    if mounted.is_empty() {
        Ok(())
    } else {
        Err(MountError::UnmountFailed {
            device: drive.name.clone(),
            remaining: mounted,
        })
    }
}

fn require_exists(inventory: &Inventory, name: &str) -> Result<Drive, DeviceError> {
    inventory
        .get_by_name(name, false)
        .ok_or_else(|| DeviceError::NotFound(name.to_string()))
}

/// Only MEDIA-class drives (removable or USB/MMC-attached, not mounted at a
/// system path) are legal targets for destructive operations.
fn require_media(inventory: &Inventory, drive: &Drive) -> Result<(), DeviceError> {
    if inventory.classify(drive) == DriveClass::Media {
        Ok(())
    } else {
        Err(DeviceError::NotRemovable(drive.name.clone()))
    }
}

/// Full pre-flight check for a clone operation: both devices exist, are
/// distinct, are unmounted, the destination is removable media, and (when
/// `check_space` is set) the destination has at least as much capacity as
/// the source.
pub fn validate_clone_operation(
    inventory: &Inventory,
    src_name: &str,
    dst_name: &str,
    check_space: bool,
) -> Result<(Drive, Drive), StorageError> {
    let src = require_exists(inventory, src_name)?;
    let dst = require_exists(inventory, dst_name)?;

    if base_device(&src.name) == base_device(&dst.name) {
        return Err(CloneError::SameDevice(src.name).into());
    }

    require_unmounted(&src)?;
    require_unmounted(&dst)?;
    require_media(inventory, &dst)?;

    if check_space {
        if src.size_bytes == 0 {
            return Err(DeviceError::Validation {
                device: src.name.clone(),
                field: "size",
            }
            .into());
        }
        if dst.size_bytes == 0 {
            return Err(DeviceError::Validation {
                device: dst.name.clone(),
                field: "size",
            }
            .into());
        }
        if dst.size_bytes < src.size_bytes {
            return Err(CloneError::InsufficientSpace {
                device: dst.name.clone(),
                need_bytes: src.size_bytes,
                have_bytes: dst.size_bytes,
            }
            .into());
        }
    }

    Ok((src, dst))
}

/// Pre-flight check shared by erase, format, and restore: the device
/// exists, is unmounted, and is removable media.
pub fn validate_destructive_operation(
    inventory: &Inventory,
    name: &str,
) -> Result<Drive, StorageError> {
    let drive = require_exists(inventory, name)?;
    require_unmounted(&drive)?;
    require_media(inventory, &drive)?;
    Ok(drive)
}

pub fn validate_erase_operation(inventory: &Inventory, name: &str) -> Result<Drive, StorageError> {
    validate_destructive_operation(inventory, name)
}

pub fn validate_format_operation(inventory: &Inventory, name: &str) -> Result<Drive, StorageError> {
    validate_destructive_operation(inventory, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Partition, PartitionTable, Transport};

    fn media_drive(name: &str, size: u64, mounted: bool) -> Drive {
        Drive {
            name: name.to_string(),
            path: format!("/dev/{name}").into(),
            size_bytes: size,
            rotational: false,
            removable: true,
            transport: Transport::Usb,
            vendor: None,
            model: None,
            serial: None,
            table: PartitionTable::Gpt,
            partitions: if mounted {
                vec![Partition {
                    name: format!("{name}1"),
                    path: format!("/dev/{name}1").into(),
                    size_bytes: size,
                    fstype: Some("ext4".into()),
                    fs_label: None,
                    mountpoint: Some("/mnt/x".into()),
                    partition_number: Some(1),
                }]
            } else {
                vec![]
            },
        }
    }

    // These tests exercise the ordering logic directly against constructed
    // `Drive` values rather than going through `Inventory::snapshot`, since
    // that requires a real `lsblk`. Mount state is checked against
    // `active_mountpoints()` here rather than `require_unmounted`, which
    // re-reads the real `/proc/mounts` and so can't be driven by a fixture.
    fn check_order(src: Drive, dst: Drive, check_space: bool) -> Result<(), StorageError> {
        if base_device(&src.name) == base_device(&dst.name) {
            return Err(CloneError::SameDevice(src.name).into());
        }
        for drive in [&src, &dst] {
            let mounted = drive.active_mountpoints();
            if !mounted.is_empty() {
                return Err(MountError::UnmountFailed {
                    device: drive.name.clone(),
                    remaining: mounted,
                }
                .into());
            }
        }
        if check_space && dst.size_bytes < src.size_bytes {
            return Err(CloneError::InsufficientSpace {
                device: dst.name,
                need_bytes: src.size_bytes,
                have_bytes: dst.size_bytes,
            }
            .into());
        }
        Ok(())
    }

    #[test]
    fn rejects_same_device() {
        let a = media_drive("sdb", 1000, false);
        let b = media_drive("sdb", 1000, false);
        let err = check_order(a, b, false).unwrap_err();
        assert!(matches!(err, StorageError::Clone(CloneError::SameDevice(_))));
    }

    #[test]
    fn rejects_mounted_destination() {
        let a = media_drive("sdb", 1000, false);
        let b = media_drive("sdc", 1000, true);
        let err = check_order(a, b, false).unwrap_err();
        assert!(matches!(err, StorageError::Mount(MountError::UnmountFailed { .. })));
    }

    #[test]
    fn rejects_insufficient_space() {
        let a = media_drive("sdb", 2000, false);
        let b = media_drive("sdc", 1000, false);
        let err = check_order(a, b, true).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Clone(CloneError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn accepts_well_formed_operation() {
        let a = media_drive("sdb", 1000, false);
        let b = media_drive("sdc", 1000, false);
        assert!(check_order(a, b, true).is_ok());
    }

    #[test]
    fn rejects_non_media_destination() {
        let inventory = Inventory::new(std::time::Duration::from_secs(5));
        let mut dst = media_drive("sda", 1000, false);
        dst.removable = false;
        dst.transport = Transport::Other("sata".into());
        let err = require_media(&inventory, &dst).unwrap_err();
        assert!(matches!(err, DeviceError::NotRemovable(_)));
    }

    #[test]
    fn distinctness_checks_base_device_not_raw_name() {
        // sdb and sdb1 share a base device even though their names differ.
        let a = media_drive("sdb", 1000, false);
        let mut b = media_drive("sdb1", 1000, false);
        b.path = "/dev/sdb1".into();
        let err = check_order(a, b, false).unwrap_err();
        assert!(matches!(err, StorageError::Clone(CloneError::SameDevice(_))));
    }
}
