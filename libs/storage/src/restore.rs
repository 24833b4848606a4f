//! Writing images from the repository back onto a target drive: plain ISO,
//! ImageUSB `.bin`, and Clonezilla image directories.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use crate::error::StorageError;
use crate::inventory::{Drive, Inventory};
use crate::runner::{CommandRunner, ProgressParser, ProgressSink, StreamOptions};

/// First 16 bytes of a `.bin` produced by ImageUSB: UTF-16LE `"imageUSB"`.
const IMAGEUSB_SIGNATURE: [u8; 16] = [
    0x69, 0x00, 0x6D, 0x00, 0x61, 0x00, 0x67, 0x00, 0x65, 0x00, 0x55, 0x00, 0x53, 0x00, 0x42, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableFormat {
    Sfdisk,
    Sgdisk,
    Parted,
}

#[derive(Debug, Clone)]
pub struct PartitionRestoreOp {
    pub partition_number: u32,
    pub fstype: Option<String>,
    pub files: Vec<PathBuf>,
    pub is_dd: bool,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub name: String,
    pub dir: PathBuf,
    pub partition_table: Option<(PartitionTableFormat, PathBuf)>,
    pub ops: Vec<PartitionRestoreOp>,
    pub compressed: bool,
}

/// Checks the first 16 bytes of `path` against the ImageUSB signature.
pub fn is_imageusb_image(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 16];
    if file.read_exact(&mut header).is_err() {
        return Ok(false);
    }
    Ok(header == IMAGEUSB_SIGNATURE)
}

/// Writes an ISO verbatim to `target`.
pub fn restore_iso(
    iso_path: &Path,
    target: &Drive,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let size = fs::metadata(iso_path)
        .map_err(|e| StorageError::Restore(e.to_string()))?
        .len();
    if size > target.size_bytes {
        return Err(StorageError::Restore(format!(
            "ISO ({size} bytes) is larger than target device ({} bytes)",
            target.size_bytes
        )));
    }

    let dev = target.path.to_string_lossy().into_owned();
    let args = [
        format!("if={}", iso_path.display()),
        format!("of={dev}"),
        "bs=4M".to_string(),
        "status=progress".to_string(),
        "conv=fsync".to_string(),
    ];
    let argv: Vec<&str> = std::iter::once("dd").chain(args.iter().map(String::as_str)).collect();
    let opts = StreamOptions {
        total_bytes: Some(size),
        title: "Restoring ISO image",
        subtitle: Some(&dev),
        ..Default::default()
    };
    let status = CommandRunner::run_streaming(&argv, opts, sink)
        .map_err(|e| StorageError::Restore(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(StorageError::Restore(format!("dd exited with {status}")))
    }
}

/// Writes an ImageUSB `.bin` to `target`, skipping its 512-byte header.
pub fn restore_imageusb(
    bin_path: &Path,
    target: &Drive,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let size = fs::metadata(bin_path)
        .map_err(|e| StorageError::Restore(e.to_string()))?
        .len();
    if size <= 512 {
        return Err(StorageError::Restore("ImageUSB image too small".to_string()));
    }
    if !is_imageusb_image(bin_path).unwrap_or(false) {
        return Err(StorageError::Restore(
            "file does not carry the ImageUSB signature".to_string(),
        ));
    }

    let dev = target.path.to_string_lossy().into_owned();
    let args = [
        format!("if={}", bin_path.display()),
        format!("of={dev}"),
        "bs=512".to_string(),
        "skip=1".to_string(),
        "status=progress".to_string(),
        "conv=fsync".to_string(),
    ];
    let argv: Vec<&str> = std::iter::once("dd").chain(args.iter().map(String::as_str)).collect();
    let opts = StreamOptions {
        total_bytes: Some(size - 512),
        title: "Restoring ImageUSB image",
        subtitle: Some(&dev),
        ..Default::default()
    };
    let status = CommandRunner::run_streaming(&argv, opts, sink)
        .map_err(|e| StorageError::Restore(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(StorageError::Restore(format!("dd exited with {status}")))
    }
}

/// Parses a Clonezilla image directory's `parts`, partition-table, and
/// per-partition image files into a [`RestorePlan`].
pub fn parse_clonezilla_image(dir: &Path) -> Result<RestorePlan, StorageError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::Restore("image directory has no name".to_string()))?
        .to_string();

    let parts_file = dir.join("parts");
    let parts = fs::read_to_string(&parts_file)
        .map_err(|e| StorageError::Restore(format!("reading {parts_file:?}: {e}")))?;
    let part_names: Vec<&str> = parts.split_whitespace().collect();

    let partition_table = find_partition_table_file(dir);

    let mut compressed = false;
    let mut ops = Vec::new();
    for part_name in &part_names {
        let number = part_name
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse::<u32>()
            .ok();
        let Some(number) = number else { continue };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| StorageError::Restore(e.to_string()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&format!("{part_name}.")))
            })
            .collect();
        files.sort();

        let is_dd = files
            .iter()
            .any(|f| f.to_string_lossy().contains("-dd-img") || f.to_string_lossy().contains(".img"));
        let fstype = files.iter().find_map(|f| extract_partclone_fstype(f));
        if files.iter().any(|f| f.to_string_lossy().ends_with(".gz")) {
            compressed = true;
        }

        ops.push(PartitionRestoreOp {
            partition_number: number,
            fstype,
            files,
            is_dd,
        });
    }

    Ok(RestorePlan {
        name,
        dir: dir.to_path_buf(),
        partition_table,
        ops,
        compressed,
    })
}

/// Finds a Clonezilla partition-table backup file in `dir`. The file is
/// named after the *source disk* (e.g. `sda-pt.sgdisk`), not the image
/// directory, so this scans for any `*-pt.<suffix>` entry rather than
/// building the expected name from the directory.
pub(crate) fn find_partition_table_file(dir: &Path) -> Option<(PartitionTableFormat, PathBuf)> {
    let entries = fs::read_dir(dir).ok()?;
    let mut by_suffix: Vec<(PathBuf, PartitionTableFormat)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let format = if file_name.ends_with("-pt.sf") {
            PartitionTableFormat::Sfdisk
        } else if file_name.ends_with("-pt.sgdisk") {
            PartitionTableFormat::Sgdisk
        } else if file_name.ends_with("-pt.parted") {
            PartitionTableFormat::Parted
        } else {
            continue;
        };
        by_suffix.push((path, format));
    }
    // Sfdisk/sgdisk precede parted when more than one backup is present, to
    // match the suffix-preference order the original scan used.
    by_suffix.sort_by_key(|(_, format)| match format {
        PartitionTableFormat::Sfdisk => 0,
        PartitionTableFormat::Sgdisk => 1,
        PartitionTableFormat::Parted => 2,
    });
    by_suffix.into_iter().next().map(|(path, format)| (format, path))
}

fn extract_partclone_fstype(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let re = regex::Regex::new(r"\.(.+?)-ptcl-img").ok()?;
    re.captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Executes a [`RestorePlan`] against `target`: writes the partition table,
/// then streams each partition's image files through `partclone` or `dd`.
pub fn restore_clonezilla(
    plan: &RestorePlan,
    target: &Drive,
    inventory: &Inventory,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let dev = target.path.to_string_lossy().into_owned();

    match &plan.partition_table {
        Some((PartitionTableFormat::Sfdisk, file)) => {
            let script = fs::read_to_string(file).map_err(|e| StorageError::Restore(e.to_string()))?;
            CommandRunner::run_checked(&["sfdisk", "--force", &dev], Some(&script))
                .map_err(|e| StorageError::Restore(e.to_string()))?;
        }
        Some((PartitionTableFormat::Sgdisk, file)) => {
            CommandRunner::run_checked(
                &["sgdisk", &format!("--load-backup={}", file.display()), &dev],
                None,
            )
            .map_err(|e| StorageError::Restore(e.to_string()))?;
        }
        Some((PartitionTableFormat::Parted, _)) => {
            return Err(StorageError::Restore(
                "parted-format partition tables are not yet supported for restore".to_string(),
            ));
        }
        None => {
            return Err(StorageError::Restore("no partition table file in image".to_string()));
        }
    }

    sleep(Duration::from_secs(2));
    let refreshed = inventory
        .get_by_name(&target.name, true)
        .ok_or_else(|| StorageError::Restore(format!("{} disappeared after partitioning", target.name)))?;

    for op in &plan.ops {
        let dst_part = refreshed
            .partitions
            .iter()
            .find(|p| p.partition_number == Some(op.partition_number))
            .ok_or_else(|| {
                StorageError::Restore(format!("no partition {} on {}", op.partition_number, target.name))
            })?;

        restore_partition(op, dst_part, plan.compressed, sink)?;
    }
    Ok(())
}

fn restore_partition(
    op: &PartitionRestoreOp,
    dst_part: &crate::inventory::Partition,
    compressed: bool,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let total: u64 = op
        .files
        .iter()
        .filter_map(|f| fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    let mut cat = Command::new("cat")
        .args(&op.files)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| StorageError::Restore(e.to_string()))?;
    let cat_out = cat.stdout.take().expect("cat stdout piped");

    let mut decompress = if compressed {
        let bin = if CommandRunner::tool_exists("pigz") { "pigz" } else { "gzip" };
        Some(
            Command::new(bin)
                .arg("-dc")
                .stdin(Stdio::from(cat_out))
                .stdout(Stdio::piped())
                .spawn()
                .map_err(|e| StorageError::Restore(e.to_string()))?,
        )
    } else {
        None
    };

    let writer_stdin = match decompress.as_mut() {
        Some(child) => Stdio::from(child.stdout.take().expect("decompress stdout piped")),
        None => Stdio::from(cat_out),
    };

    let part_path = dst_part.path.to_string_lossy().into_owned();
    let title = format!("Restoring partition {}", op.partition_number);

    let status = if op.is_dd {
        run_piped_writer("dd", &[&format!("of={part_path}"), "bs=4M", "status=progress", "conv=fsync"], writer_stdin, total, &title, sink)?
    } else {
        let tool = op
            .fstype
            .as_deref()
            .map(partclone_restore_tool)
            .unwrap_or("partclone.restore");
        run_piped_writer(tool, &["-r", "-s", "-", "-o", &part_path], writer_stdin, total, &title, sink)?
    };

    let _ = cat.wait();
    if let Some(mut d) = decompress {
        let _ = d.wait();
    }

    if status.success() {
        Ok(())
    } else {
        Err(StorageError::Restore(format!("restore pipeline exited with {status}")))
    }
}

fn partclone_restore_tool(fstype: &str) -> &'static str {
    match fstype.to_lowercase().as_str() {
        "ext2" => "partclone.ext2",
        "ext3" => "partclone.ext3",
        "ext4" => "partclone.ext4",
        "fat" | "vfat" | "fat16" | "fat32" => "partclone.fat",
        "ntfs" => "partclone.ntfs",
        "exfat" => "partclone.exfat",
        "xfs" => "partclone.xfs",
        "btrfs" => "partclone.btrfs",
        _ => "partclone.restore",
    }
}

fn run_piped_writer(
    tool: &str,
    args: &[&str],
    stdin: Stdio,
    total_bytes: u64,
    title: &str,
    sink: &mut dyn ProgressSink,
) -> Result<std::process::ExitStatus, StorageError> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(stdin)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StorageError::Restore(format!("{tool}: {e}")))?;

    sink.emit(crate::runner::ProgressFrame {
        lines: vec![title.to_string()],
        ratio: None,
    });

    if let Some(stderr) = child.stderr.take() {
        let mut parser = ProgressParser::new(Some(total_bytes));
        let mut reader = std::io::BufReader::new(stderr);
        let mut buf = String::new();
        use std::io::BufRead;
        while reader.read_line(&mut buf).unwrap_or(0) > 0 {
            let line = buf.trim();
            if !line.is_empty() {
                sink.emit(parser.ingest(line));
            }
            buf.clear();
        }
    }

    child.wait().map_err(|e| StorageError::Restore(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn imageusb_signature_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&IMAGEUSB_SIGNATURE).unwrap();
        f.write_all(&[0u8; 1024]).unwrap();
        assert!(is_imageusb_image(&path).unwrap());
    }

    #[test]
    fn rejects_file_without_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 32]).unwrap();
        assert!(!is_imageusb_image(&path).unwrap());
    }

    #[test]
    fn parses_clonezilla_plan() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("my-image");
        fs::create_dir_all(&image_dir).unwrap();
        fs::write(image_dir.join("parts"), "sda1 sda2").unwrap();
        fs::write(image_dir.join("my-image-pt.sf"), "label: dos").unwrap();
        fs::write(image_dir.join("sda1.ext4-ptcl-img.gz.aa"), []).unwrap();
        fs::write(image_dir.join("sda2.ntfs-ptcl-img.gz.aa"), []).unwrap();

        let plan = parse_clonezilla_image(&image_dir).unwrap();
        assert_eq!(plan.ops.len(), 2);
        assert!(plan.compressed);
        assert_eq!(plan.ops[0].fstype.as_deref(), Some("ext4"));
        assert!(matches!(
            plan.partition_table,
            Some((PartitionTableFormat::Sfdisk, _))
        ));
    }

    #[test]
    fn partition_table_file_keyed_on_source_disk_not_directory_name() {
        // The backup file is named after the source disk ("sda"), which
        // doesn't have to match the image directory's name.
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("2026-07-20-my-backup");
        fs::create_dir_all(&image_dir).unwrap();
        fs::write(image_dir.join("parts"), "sda1").unwrap();
        fs::write(image_dir.join("sda-pt.sgdisk"), []).unwrap();
        fs::write(image_dir.join("sda1.ext4-ptcl-img.aa"), []).unwrap();

        let plan = parse_clonezilla_image(&image_dir).unwrap();
        assert!(matches!(
            plan.partition_table,
            Some((PartitionTableFormat::Sgdisk, _))
        ));
    }
}
