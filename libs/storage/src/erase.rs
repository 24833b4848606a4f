//! Wiping a device before it's reused or retired.

use crate::error::StorageError;
use crate::inventory::Drive;
use crate::runner::{CommandRunner, ProgressSink, StreamOptions};

/// Default amount wiped at each end of the device in [`EraseMode::Quick`].
pub const DEFAULT_QUICK_WIPE_MIB: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// Zero the first and last `quick_wipe_mib` of the device.
    Quick,
    /// Zero the entire device.
    Zero,
    /// TRIM the device via `blkdiscard`.
    Discard,
    /// One pass of random data then zeros, via `shred`.
    Secure,
}

impl EraseMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("zero") => EraseMode::Zero,
            Some("discard") => EraseMode::Discard,
            Some("secure") => EraseMode::Secure,
            _ => EraseMode::Quick,
        }
    }
}

fn run_dd(dev: &str, count_mib: Option<u64>, seek_mib: Option<u64>, total: u64, sink: &mut dyn ProgressSink) -> Result<(), StorageError> {
    let mut args = vec![
        "if=/dev/zero".to_string(),
        format!("of={dev}"),
        "bs=1M".to_string(),
        "status=progress".to_string(),
        "conv=fsync".to_string(),
    ];
    if let Some(count) = count_mib {
        args.push(format!("count={count}"));
    }
    if let Some(seek) = seek_mib {
        args.push(format!("seek={seek}"));
    }
    let argv: Vec<&str> = std::iter::once("dd").chain(args.iter().map(String::as_str)).collect();
    let opts = StreamOptions {
        total_bytes: Some(total),
        title: "Erasing",
        subtitle: Some(dev),
        ..Default::default()
    };
    let status = CommandRunner::run_streaming(&argv, opts, sink)?;
    if status.success() {
        Ok(())
    } else {
        Err(StorageError::Erase(format!("dd exited with {status}")))
    }
}

/// Erases `drive` using `mode`. The caller is responsible for validating
/// and unmounting the device first.
pub fn erase_device(
    drive: &Drive,
    mode: EraseMode,
    quick_wipe_mib: u64,
    sink: &mut dyn ProgressSink,
) -> Result<(), StorageError> {
    let dev = drive.path.to_string_lossy().into_owned();
    match mode {
        EraseMode::Quick => {
            CommandRunner::run_checked(&["wipefs", "-a", &dev], None)
                .map_err(|e| StorageError::Erase(e.to_string()))?;
            let size_mib = drive.size_bytes / (1024 * 1024);
            run_dd(&dev, Some(quick_wipe_mib), None, quick_wipe_mib * 1024 * 1024, sink)?;
            if size_mib > quick_wipe_mib {
                run_dd(
                    &dev,
                    Some(quick_wipe_mib),
                    Some(size_mib - quick_wipe_mib),
                    quick_wipe_mib * 1024 * 1024,
                    sink,
                )?;
            }
            Ok(())
        }
        EraseMode::Zero => run_dd(&dev, None, None, drive.size_bytes, sink),
        EraseMode::Discard => {
            let status = CommandRunner::run_streaming(
                &["blkdiscard", &dev],
                StreamOptions {
                    total_bytes: Some(drive.size_bytes),
                    title: "Discarding",
                    subtitle: Some(&dev),
                    ..Default::default()
                },
                sink,
            )?;
            if status.success() {
                Ok(())
            } else {
                Err(StorageError::Erase(format!("blkdiscard exited with {status}")))
            }
        }
        EraseMode::Secure => {
            let status = CommandRunner::run_streaming(
                &["shred", "-v", "-n", "1", "-z", &dev],
                StreamOptions {
                    total_bytes: Some(drive.size_bytes),
                    title: "Securely erasing",
                    subtitle: Some(&dev),
                    ..Default::default()
                },
                sink,
            )?;
            if status.success() {
                Ok(())
            } else {
                Err(StorageError::Erase(format!("shred exited with {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_defaults_to_quick() {
        assert_eq!(EraseMode::parse(None), EraseMode::Quick);
        assert_eq!(EraseMode::parse(Some("")), EraseMode::Quick);
    }

    #[test]
    fn mode_parse_recognizes_all_variants() {
        assert_eq!(EraseMode::parse(Some("zero")), EraseMode::Zero);
        assert_eq!(EraseMode::parse(Some("discard")), EraseMode::Discard);
        assert_eq!(EraseMode::parse(Some("SECURE")), EraseMode::Secure);
    }
}
