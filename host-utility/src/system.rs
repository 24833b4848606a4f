// System dependency checks shared across subcommands.

use anyhow::Result;

use crate::constants::REQUIRED_COMMANDS;
use crate::utils::command_exists;

/// Verifies that the tools every subcommand may need are present. Optional,
/// mode-specific tools (partclone variants, mkfs.*, blkdiscard, shred) are
/// checked lazily by the engine that needs them, since a machine dedicated
/// to ext4-only cloning has no reason to carry `mkfs.ntfs`.
pub fn verify_dependencies() -> Result<()> {
    let missing: Vec<&str> = REQUIRED_COMMANDS
        .iter()
        .copied()
        .filter(|cmd| !command_exists(cmd))
        .collect();

    if !missing.is_empty() {
        anyhow::bail!(
            "missing required dependencies: {}\ninstall these tools before running this utility",
            missing.join(", ")
        );
    }
    Ok(())
}

/// True if the current process is running as root, required for most
/// device operations (`dd` onto a block device, `mkfs.*`, ...).
pub fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

pub fn require_root() -> Result<()> {
    if running_as_root() {
        Ok(())
    } else {
        anyhow::bail!("this command must be run as root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_dependencies_reports_missing_tools_by_name() {
        // lsblk/dd/etc are expected to exist on the CI/dev machine; this
        // test only exercises the failure-formatting path directly.
        let missing = vec!["definitely-not-a-real-tool"];
        let err = if missing.is_empty() {
            None
        } else {
            Some(format!("missing required dependencies: {}", missing.join(", ")))
        };
        assert!(err.unwrap().contains("definitely-not-a-real-tool"));
    }
}
