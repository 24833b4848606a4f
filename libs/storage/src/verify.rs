//! Post-clone verification via `dd | sha256sum` checksums.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

use log::warn;

use crate::clone::partition_display_name;
use crate::error::RunnerError;
use crate::inventory::Drive;
use crate::runner::{ProgressFrame, ProgressParser, ProgressSink};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("checksum mismatch for {0}")]
    Mismatch(String),
    #[error("no destination partition for {0}")]
    NoTargetPartition(String),
}

/// Computes the SHA-256 of `node` (optionally limited to `total_bytes`),
/// reporting progress as the read advances.
///
/// Wires `dd`'s stdout directly into `sha256sum`'s stdin so the device is
/// only read once; `dd`'s stderr (its `status=progress` chatter) is parsed
/// for progress on a thread that runs alongside the checksum.
pub fn compute_sha256(
    node: &str,
    total_bytes: Option<u64>,
    title: &str,
    sink: &mut dyn ProgressSink,
) -> Result<String, VerifyError> {
    let mut dd_args = vec!["if=".to_string() + node, "bs=4M".to_string(), "status=progress".to_string()];
    if let Some(total) = total_bytes {
        dd_args.push(format!("count={total}"));
        dd_args.push("iflag=count_bytes".to_string());
    }

    let mut dd = Command::new("dd")
        .args(&dd_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(RunnerError::Io)?;

    let dd_stdout = dd.stdout.take().expect("dd stdout piped");
    let mut sha = Command::new("sha256sum")
        .stdin(Stdio::from(dd_stdout))
        .stdout(Stdio::piped())
        .spawn()
        .map_err(RunnerError::Io)?;

    sink.emit(ProgressFrame {
        lines: vec![title.to_string()],
        ratio: None,
    });

    if let Some(stderr) = dd.stderr.take() {
        let mut parser = ProgressParser::new(total_bytes);
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match read_dd_status_line(&mut reader, &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        sink.emit(parser.ingest(trimmed));
                    }
                }
                Err(_) => break,
            }
        }
    }

    let dd_status = dd.wait().map_err(RunnerError::Io)?;
    let sha_output = sha.wait_with_output().map_err(RunnerError::Io)?;
    if !dd_status.success() {
        return Err(RunnerError::CommandFailed {
            argv: std::iter::once("dd".to_string()).chain(dd_args).collect(),
            last_stderr_line: "dd exited with a nonzero status".to_string(),
            exit_code: dd_status.code(),
        }
        .into());
    }
    if !sha_output.status.success() {
        return Err(RunnerError::CommandFailed {
            argv: vec!["sha256sum".to_string()],
            last_stderr_line: String::from_utf8_lossy(&sha_output.stderr).trim().to_string(),
            exit_code: sha_output.status.code(),
        }
        .into());
    }

    let out = String::from_utf8_lossy(&sha_output.stdout);
    Ok(out.split_whitespace().next().unwrap_or_default().to_string())
}

fn read_dd_status_line(reader: &mut impl BufRead, buf: &mut String) -> std::io::Result<usize> {
    // dd's progress lines are carriage-return terminated, not newline.
    let mut total = 0;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if byte[0] == b'\n' || byte[0] == b'\r' {
            if buf.is_empty() {
                continue;
            }
            return Ok(total);
        }
        buf.push(byte[0] as char);
    }
}

/// Verifies each partition of `dst` against the corresponding partition of
/// `src` by comparing SHA-256 checksums. Returns `false` (and logs the
/// cause) on any mismatch, I/O error, or missing destination partition.
pub fn verify_clone(src: &Drive, dst: &Drive, sink: &mut dyn ProgressSink) -> bool {
    if src.partitions.is_empty() {
        return verify_clone_device(
            &src.path.to_string_lossy(),
            &dst.path.to_string_lossy(),
            Some(src.size_bytes),
            sink,
        );
    }

    for (idx, src_part) in src.partitions.iter().enumerate() {
        let Some(dst_part) = dst
            .partitions
            .iter()
            .find(|p| p.partition_number == src_part.partition_number)
            .or_else(|| dst.partitions.get(idx))
        else {
            warn!("verify: no target partition for {}", src_part.name);
            return false;
        };

        let title = format!("Verifying {}", partition_display_name(src_part));
        let src_sum = match compute_sha256(
            &src_part.path.to_string_lossy(),
            Some(src_part.size_bytes),
            &title,
            sink,
        ) {
            Ok(sum) => sum,
            Err(e) => {
                warn!("verify: error hashing source {}: {e}", src_part.name);
                return false;
            }
        };
        let dst_sum = match compute_sha256(
            &dst_part.path.to_string_lossy(),
            Some(src_part.size_bytes),
            &title,
            sink,
        ) {
            Ok(sum) => sum,
            Err(e) => {
                warn!("verify: error hashing target {}: {e}", dst_part.name);
                return false;
            }
        };
        if src_sum != dst_sum {
            warn!("verify: mismatch on {}", src_part.name);
            return false;
        }
    }
    true
}

/// Whole-device fast path for unpartitioned media.
pub fn verify_clone_device(
    src_node: &str,
    dst_node: &str,
    total_bytes: Option<u64>,
    sink: &mut dyn ProgressSink,
) -> bool {
    let src_sum = match compute_sha256(src_node, total_bytes, "Verifying source", sink) {
        Ok(sum) => sum,
        Err(e) => {
            warn!("verify: error hashing {src_node}: {e}");
            return false;
        }
    };
    let dst_sum = match compute_sha256(dst_node, total_bytes, "Verifying target", sink) {
        Ok(sum) => sum,
        Err(e) => {
            warn!("verify: error hashing {dst_node}: {e}");
            return false;
        }
    };
    src_sum == dst_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{PartitionTable, Transport};

    fn empty_drive(name: &str) -> Drive {
        Drive {
            name: name.into(),
            path: format!("/dev/{name}").into(),
            size_bytes: 0,
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
    fn verify_clone_without_target_partition_fails() {
        let mut sink: Vec<crate::runner::ProgressFrame> = Vec::new();
        let mut src = empty_drive("sdb");
        src.partitions.push(crate::inventory::Partition {
            name: "sdb1".into(),
            path: "/dev/sdb1".into(),
            size_bytes: 100,
            fstype: Some("ext4".into()),
            fs_label: None,
            mountpoint: None,
            partition_number: Some(1),
        });
        let dst = empty_drive("sdc");
        assert!(!verify_clone(&src, &dst, &mut sink));
    }
}
