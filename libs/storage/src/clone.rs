//! Duplicating one block device onto another.

use log::warn;

use crate::error::{CloneError, StorageError};
use crate::inventory::{base_device, Drive, Partition, PartitionTable};
use crate::runner::{CommandRunner, ProgressSink, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Whole-device `dd`, byte for byte, no filesystem awareness.
    Exact,
    /// Partition-table-aware copy using `partclone`/`dd` per partition.
    Smart,
    /// `Smart`, followed immediately by verification.
    Verify,
}

impl CloneMode {
    /// Parses a mode string, defaulting to `Smart` for `None`/empty, as the
    /// original appliance's `CLONE_MODE` setting does.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("exact") => CloneMode::Exact,
            Some("verify") => CloneMode::Verify,
            _ => CloneMode::Smart,
        }
    }

    pub fn requires_space_check(self) -> bool {
        !matches!(self, CloneMode::Exact)
    }
}

/// Maps a source filesystem type to the `partclone.*` binary that
/// understands it. Filesystems absent from this table fall back to `dd`.
fn partclone_tool(fstype: &str) -> Option<&'static str> {
    match fstype.to_lowercase().as_str() {
        "ext2" => Some("partclone.ext2"),
        "ext3" => Some("partclone.ext3"),
        "ext4" => Some("partclone.ext4"),
        "vfat" | "fat16" | "fat32" => Some("partclone.fat"),
        "ntfs" => Some("partclone.ntfs"),
        "exfat" => Some("partclone.exfat"),
        "xfs" => Some("partclone.xfs"),
        "btrfs" => Some("partclone.btrfs"),
        _ => None,
    }
}

/// Friendly filesystem name for progress titles/subtitles.
pub fn format_filesystem_type(fstype: &str) -> String {
    match fstype.to_lowercase().as_str() {
        "vfat" | "fat32" => "FAT32".into(),
        "fat16" => "FAT16".into(),
        "ntfs" => "NTFS".into(),
        "exfat" => "exFAT".into(),
        "ext2" => "ext2".into(),
        "ext3" => "ext3".into(),
        "ext4" => "ext4".into(),
        "xfs" => "XFS".into(),
        "btrfs" => "Btrfs".into(),
        other => other.to_string(),
    }
}

/// Display name for a partition in progress output: GPT/fs label, else the
/// device name, else a generic fallback.
pub fn partition_display_name(part: &Partition) -> String {
    part.fs_label
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if part.name.is_empty() {
                "partition".to_string()
            } else {
                part.name.clone()
            }
        })
}

/// Byte-for-byte raw copy of the entire device.
pub fn clone_exact(
    src: &Drive,
    dst: &Drive,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let argv_owned = [
        format!("if={}", src.path.display()),
        format!("of={}", dst.path.display()),
        "bs=4M".to_string(),
        "status=progress".to_string(),
        "conv=fsync".to_string(),
    ];
    let argv: Vec<&str> = std::iter::once("dd")
        .chain(argv_owned.iter().map(String::as_str))
        .collect();
    let opts = StreamOptions {
        total_bytes: Some(src.size_bytes),
        title: "Cloning whole device",
        subtitle: Some(&src.name),
        ..Default::default()
    };
    let status = CommandRunner::run_streaming(&argv, opts, sink)?;
    if status.success() {
        Ok(())
    } else {
        Err(CloneError::OperationFailed(format!("dd exited with {status}")).into())
    }
}

/// Replicates `src`'s partition table onto `dst`.
fn copy_partition_table(src: &Drive, dst: &Drive) -> Result<(), StorageError> {
    match src.table {
        PartitionTable::Gpt => {
            CommandRunner::run_checked(
                &[
                    "sgdisk",
                    &format!("--replicate={}", dst.path.display()),
                    "--randomize-guids",
                    &src.path.to_string_lossy(),
                ],
                None,
            )?;
        }
        PartitionTable::Mbr => {
            let dump = CommandRunner::run_checked(
                &["sfdisk", "--dump", &src.path.to_string_lossy()],
                None,
            )?;
            CommandRunner::run_checked(&["sfdisk", &dst.path.to_string_lossy()], Some(&dump))?;
        }
        PartitionTable::None => {
            return Err(CloneError::UnsupportedPartitionTable("none".into()).into());
        }
    }
    Ok(())
}

/// Partition-aware copy: replicates the table, then copies each partition
/// using `partclone` when the source filesystem is recognized, `dd`
/// otherwise.
pub fn clone_smart(
    src: &Drive,
    dst_before: &Drive,
    refreshed_dst: impl Fn() -> Result<Drive, StorageError>,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    copy_partition_table(src, dst_before)?;
    let dst = refreshed_dst()?;

    let total = src.partitions.len();
    for (idx, src_part) in src.partitions.iter().enumerate() {
        let dst_part = dst
            .partitions
            .iter()
            .find(|p| p.partition_number == src_part.partition_number)
            .or_else(|| dst.partitions.get(idx))
            .ok_or_else(|| CloneError::OperationFailed(format!(
                "no destination partition for {}",
                src_part.name
            )))?;

        let title = format!(
            "Cloning {} ({}/{})",
            partition_display_name(src_part),
            idx + 1,
            total
        );
        let subtitle = src_part
            .fstype
            .as_deref()
            .map(format_filesystem_type)
            .unwrap_or_default();

        let tool = src_part.fstype.as_deref().and_then(partclone_tool);
        match tool {
            Some(tool) => {
                let status = CommandRunner::run_streaming(
                    &[
                        tool,
                        "-c",
                        "-F",
                        "-s",
                        &src_part.path.to_string_lossy(),
                        "-o",
                        &dst_part.path.to_string_lossy(),
                    ],
                    StreamOptions {
                        total_bytes: Some(src_part.size_bytes),
                        title: &title,
                        subtitle: Some(&subtitle),
                        ..Default::default()
                    },
                    sink,
                )?;
                if !status.success() {
                    return Err(CloneError::OperationFailed(format!(
                        "{tool} exited with {status}"
                    ))
                    .into());
                }
            }
            None => {
                warn!(
                    "no partclone tool for fstype {:?} on {}, falling back to dd",
                    src_part.fstype, src_part.name
                );
                let argv_owned = [
                    format!("if={}", src_part.path.display()),
                    format!("of={}", dst_part.path.display()),
                    "bs=4M".to_string(),
                    "status=progress".to_string(),
                    "conv=fsync".to_string(),
                ];
                let argv: Vec<&str> = std::iter::once("dd")
                    .chain(argv_owned.iter().map(String::as_str))
                    .collect();
                let status = CommandRunner::run_streaming(
                    &argv,
                    StreamOptions {
                        total_bytes: Some(src_part.size_bytes),
                        title: &title,
                        subtitle: Some(&subtitle),
                        ..Default::default()
                    },
                    sink,
                )?;
                if !status.success() {
                    return Err(CloneError::OperationFailed(format!("dd exited with {status}")).into());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_defaults_to_smart() {
        assert_eq!(CloneMode::parse(None), CloneMode::Smart);
        assert_eq!(CloneMode::parse(Some("")), CloneMode::Smart);
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(CloneMode::parse(Some("EXACT")), CloneMode::Exact);
        assert_eq!(CloneMode::parse(Some("Verify")), CloneMode::Verify);
    }

    #[test]
    fn exact_mode_skips_space_check() {
        assert!(!CloneMode::Exact.requires_space_check());
        assert!(CloneMode::Smart.requires_space_check());
    }

    #[test]
    fn friendly_fstype_names() {
        assert_eq!(format_filesystem_type("vfat"), "FAT32");
        assert_eq!(format_filesystem_type("ntfs"), "NTFS");
        assert_eq!(format_filesystem_type("btrfs"), "Btrfs");
    }

    #[test]
    fn partition_display_prefers_label() {
        let p = Partition {
            name: "sdb1".into(),
            path: "/dev/sdb1".into(),
            size_bytes: 0,
            fstype: Some("ext4".into()),
            fs_label: Some("DATA".into()),
            mountpoint: None,
            partition_number: Some(1),
        };
        assert_eq!(partition_display_name(&p), "DATA");
    }

    #[test]
    fn partclone_tool_maps_known_filesystems() {
        assert_eq!(partclone_tool("ext4"), Some("partclone.ext4"));
        assert_eq!(partclone_tool("exfat"), Some("partclone.exfat"));
        assert_eq!(partclone_tool("zfs"), None);
    }

    #[test]
    fn base_device_used_for_partition_matching_sanity() {
        // clone_smart matches by partition_number first; base_device is a
        // shared helper exercised thoroughly in the inventory module.
        assert_eq!(base_device("sdb1"), "sdb");
    }
}
