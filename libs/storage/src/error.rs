use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving or classifying block devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("{field} missing for {device}")]
    Validation { device: String, field: &'static str },

    #[error("not removable: {0}")]
    NotRemovable(String),
}

/// Errors raised while unmounting or remounting partitions.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to unmount {device}: still mounted at {0:?}", .remaining)]
    UnmountFailed {
        device: String,
        remaining: Vec<PathBuf>,
    },

    #[error("mount verification failed for {device}: {reason}")]
    MountVerification { device: String, reason: String },
}

/// Errors raised by the clone engine.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("same device given as source and destination: {0}")]
    SameDevice(String),

    #[error("insufficient space on {device}: need {need_bytes} bytes, have {have_bytes} bytes")]
    InsufficientSpace {
        device: String,
        need_bytes: u64,
        have_bytes: u64,
    },

    #[error("unsupported partition table type: {0}")]
    UnsupportedPartitionTable(String),

    #[error("{0}")]
    OperationFailed(String),
}

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command failed (exit {exit_code:?}): {argv:?}: {last_stderr_line}")]
    CommandFailed {
        argv: Vec<String>,
        last_stderr_line: String,
        exit_code: Option<i32>,
    },

    #[error("required tool not found on PATH: {0}")]
    ToolMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The top-level error type surfaced by every storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("format failed: {0}")]
    Format(String),

    #[error("erase failed: {0}")]
    Erase(String),

    #[error("restore failed: {0}")]
    Restore(String),
}
