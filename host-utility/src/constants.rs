// Constants for the rpi-cloner command-line front end.
//
// This module centralizes hardcoded values shared across subcommands so
// configuration changes have one place to land.

use inquire::ui::Color;

// ============================================================================
// External tool requirements
// ============================================================================

/// Tools every subcommand may shell out to; checked once at startup so a
/// missing dependency fails fast with a clear message instead of partway
/// through a destructive operation.
pub const REQUIRED_COMMANDS: &[&str] = &[
    "lsblk",
    "dd",
    "umount",
    "sync",
    "wipefs",
    "sha256sum",
    "parted",
];

/// Tools that are used by specific subcommands but not required for every
/// invocation (partition-table and filesystem tooling, erase extras).
pub const OPTIONAL_COMMANDS: &[&str] = &[
    "sfdisk",
    "sgdisk",
    "blkdiscard",
    "shred",
    "mkfs.ext4",
    "mkfs.vfat",
    "mkfs.exfat",
    "mkfs.ntfs",
    "partclone.ext4",
    "partclone.fat",
    "partclone.ntfs",
    "partclone.exfat",
    "partclone.xfs",
    "partclone.btrfs",
    "pigz",
    "gzip",
    "blockdev",
    "udisksctl",
    "hdparm",
];

// ============================================================================
// Networking defaults (peer transfer)
// ============================================================================

pub const DEFAULT_TRANSFER_PORT: u16 = 8765;
pub const MDNS_SERVICE_TYPE: &str = "_rpi-cloner._tcp.local.";

// ============================================================================
// Progress bar / prompt theming
// ============================================================================

/// Orange theme color - single source of truth for RGB values.
pub const ORANGE: (u8, u8, u8) = (255, 175, 0);

pub const ORANGE_RGB: Color = Color::Rgb {
    r: ORANGE.0,
    g: ORANGE.1,
    b: ORANGE.2,
};

/// Calculate nearest xterm-256 color index from RGB.
///
/// The xterm-256 palette (colors 16-231) is a 6x6x6 RGB cube where each
/// component maps to values: 0, 95, 135, 175, 215, 255.
const fn rgb_to_xterm256(r: u8, g: u8, b: u8) -> u8 {
    const fn nearest_idx(val: u8) -> u8 {
        if val < 48 {
            0
        } else if val < 115 {
            1
        } else if val < 155 {
            2
        } else if val < 195 {
            3
        } else if val < 235 {
            4
        } else {
            5
        }
    }
    16 + 36 * nearest_idx(r) + 6 * nearest_idx(g) + nearest_idx(b)
}

pub const ORANGE_256: u8 = rgb_to_xterm256(ORANGE.0, ORANGE.1, ORANGE.2);
