//! Partitioning and formatting a device with a single filesystem.

use std::thread::sleep;
use std::time::Duration;

use crate::error::StorageError;
use crate::inventory::Drive;
use crate::runner::{CommandRunner, ProgressSink, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    Quick,
    Full,
}

impl FormatMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("full") => FormatMode::Full,
            _ => FormatMode::Quick,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Ext4,
    Vfat,
    Exfat,
    Ntfs,
}

impl Filesystem {
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value.to_lowercase().as_str() {
            "ext4" => Ok(Filesystem::Ext4),
            "vfat" | "fat32" => Ok(Filesystem::Vfat),
            "exfat" => Ok(Filesystem::Exfat),
            "ntfs" => Ok(Filesystem::Ntfs),
            other => Err(StorageError::Format(format!("unsupported filesystem: {other}"))),
        }
    }
}

/// The device node for the device's sole data partition, following the
/// appliance's one-partition-per-device convention: a digit-ending base
/// name gets a `p` before the partition number (`mmcblk0` -> `mmcblk0p1`,
/// `nvme0n1` -> `nvme0n1p1`), otherwise it's appended directly
/// (`sda` -> `sda1`).
pub fn first_partition_node(base: &str) -> String {
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{base}p1")
    } else {
        format!("{base}1")
    }
}

/// Partitions and formats `drive` with a single `fs`-typed partition
/// spanning the whole device. The caller is responsible for validating and
/// unmounting the device first.
pub fn format_device(
    drive: &Drive,
    fs: Filesystem,
    mode: FormatMode,
    label: Option<&str>,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let dev = drive.path.to_string_lossy().into_owned();

    CommandRunner::run_checked(&["parted", "-s", &dev, "mklabel", "msdos"], None)
        .map_err(|e| StorageError::Format(e.to_string()))?;
    CommandRunner::run_checked(
        &["parted", "-s", &dev, "mkpart", "primary", "1MiB", "100%"],
        None,
    )
    .map_err(|e| StorageError::Format(e.to_string()))?;
    sleep(Duration::from_secs(1));

    let part_node = format!("/dev/{}", first_partition_node(&drive.name));

    let (argv, parses_percent) = mkfs_command(fs, mode, label, &part_node);
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let opts = StreamOptions {
        total_bytes: if parses_percent { None } else { Some(drive.size_bytes) },
        title: "Formatting",
        subtitle: Some(&part_node),
        ..Default::default()
    };
    let status = CommandRunner::run_streaming(&argv_refs, opts, sink)
        .map_err(|e| StorageError::Format(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(StorageError::Format(format!("{} exited with {status}", argv[0])))
    }
}

fn mkfs_command(
    fs: Filesystem,
    mode: FormatMode,
    label: Option<&str>,
    part_node: &str,
) -> (Vec<String>, bool) {
    let mut argv = match fs {
        Filesystem::Ext4 => {
            let mut v = vec!["mkfs.ext4".to_string(), "-F".to_string()];
            if mode == FormatMode::Full {
                v.push("-c".to_string());
            }
            v
        }
        Filesystem::Vfat => vec!["mkfs.vfat".to_string(), "-F".to_string(), "32".to_string()],
        Filesystem::Exfat => vec!["mkfs.exfat".to_string()],
        Filesystem::Ntfs => {
            let mut v = vec!["mkfs.ntfs".to_string()];
            if mode == FormatMode::Quick {
                v.push("-f".to_string());
            }
            v
        }
    };
    if let Some(label) = label {
        match fs {
            Filesystem::Ext4 => argv.extend(["-L".to_string(), label.to_string()]),
            Filesystem::Vfat => argv.extend(["-n".to_string(), label.to_string()]),
            Filesystem::Exfat => argv.extend(["-n".to_string(), label.to_string()]),
            Filesystem::Ntfs => argv.extend(["-L".to_string(), label.to_string()]),
        }
    }
    argv.push(part_node.to_string());
    let parses_percent = fs == Filesystem::Ext4;
    (argv, parses_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_partition_node_for_plain_disk() {
        assert_eq!(first_partition_node("sda"), "sda1");
    }

    #[test]
    fn first_partition_node_for_digit_ending_names() {
        assert_eq!(first_partition_node("mmcblk0"), "mmcblk0p1");
        assert_eq!(first_partition_node("nvme0n1"), "nvme0n1p1");
    }

    #[test]
    fn filesystem_parse_accepts_aliases() {
        assert_eq!(Filesystem::parse("fat32").unwrap(), Filesystem::Vfat);
        assert!(Filesystem::parse("zfs").is_err());
    }

    #[test]
    fn mkfs_command_adds_label_flag_per_filesystem() {
        let (argv, _) = mkfs_command(Filesystem::Vfat, FormatMode::Quick, Some("DATA"), "/dev/sdb1");
        assert!(argv.contains(&"-n".to_string()));
        assert!(argv.contains(&"DATA".to_string()));
    }
}
