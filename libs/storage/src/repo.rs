//! Discovering and inventorying image repositories: media drives flagged to
//! hold backup images, and the images found on them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::inventory::Inventory;
use crate::restore::{find_partition_table_file, is_imageusb_image};
use crate::runner::CommandRunner;

/// Marker file that identifies a partition as an image repository.
pub const REPO_FLAG_FILENAME: &str = ".rpi-usb-cloner-image-repo";

const TEMP_EXTENSIONS: [&str; 4] = ["tmp", "part", "partial", "swp"];

#[derive(Debug, Clone)]
pub struct ImageRepo {
    pub path: PathBuf,
    pub drive_name: String,
}

#[derive(Debug, Clone)]
pub enum DiskImage {
    Iso {
        name: String,
        path: PathBuf,
        size: u64,
    },
    ImageUsbBin {
        name: String,
        path: PathBuf,
        size: u64,
    },
    ClonezillaDir {
        name: String,
        path: PathBuf,
        parts: Vec<String>,
        partition_table_file: Option<PathBuf>,
        compressed: bool,
    },
}

impl DiskImage {
    pub fn name(&self) -> &str {
        match self {
            DiskImage::Iso { name, .. } => name,
            DiskImage::ImageUsbBin { name, .. } => name,
            DiskImage::ClonezillaDir { name, .. } => name,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            DiskImage::Iso { path, .. } => path,
            DiskImage::ImageUsbBin { path, .. } => path,
            DiskImage::ClonezillaDir { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepoUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub by_type: HashMap<&'static str, u64>,
}

fn is_temp_path(path: &Path) -> bool {
    if path
        .components()
        .any(|c| matches!(c.as_os_str().to_str(), Some(s) if s.eq_ignore_ascii_case("tmp") || s.eq_ignore_ascii_case("temp")))
    {
        return true;
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if name.starts_with('.') {
            return true;
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if TEMP_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                return true;
            }
        }
    }
    false
}

fn sum_tree_bytes(dir: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if is_temp_path(&path) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.is_dir() {
                total += sum_tree_bytes(&path);
            } else {
                total += meta.len();
            }
        }
    }
    total
}

/// Scans every media partition for a repo flag file, mounting unmounted
/// candidates on demand (mount failures simply drop the candidate, they are
/// not surfaced as errors).
pub fn find_image_repos(inventory: &Inventory, flag_filename: &str) -> Vec<ImageRepo> {
    let mut repos = Vec::new();
    let Ok(drives) = inventory.snapshot(false) else {
        return repos;
    };

    for drive in &drives {
        for part in &drive.partitions {
            let Some(mountpoint) = part.mountpoint.clone().or_else(|| try_mount(part)) else {
                continue;
            };
            let flag = mountpoint.join(flag_filename);
            if flag.exists() {
                repos.push(ImageRepo {
                    path: mountpoint,
                    drive_name: drive.name.clone(),
                });
            }
        }
    }
    repos
}

/// Mounts an unmounted partition under a scratch directory so its flag file
/// (if any) can be inspected. Returns `None` on any failure, which
/// `find_image_repos` treats as "not a repo" rather than an error.
fn try_mount(part: &crate::inventory::Partition) -> Option<PathBuf> {
    let name = part.path.file_name()?.to_str()?;
    let target = std::env::temp_dir().join(format!("rpi-cloner-repo-{name}"));
    if !target.exists() {
        fs::create_dir_all(&target).ok()?;
    }
    CommandRunner::run_checked(
        &["mount", "--read-only", &part.path.to_string_lossy(), &target.to_string_lossy()],
        None,
    )
    .ok()?;
    Some(target)
}

/// Drive names currently hosting at least one image repository, for
/// excluding them from `Inventory::list_media_drives`.
pub fn repo_owned_drive_names(inventory: &Inventory, flag_filename: &str) -> HashSet<String> {
    find_image_repos(inventory, flag_filename)
        .into_iter()
        .map(|r| r.drive_name)
        .collect()
}

/// Lists every disk image found directly under the repo root, or under its
/// `clonezilla`/`images` subdirectories.
pub fn list_images(repo_root: &Path) -> Vec<DiskImage> {
    let mut images = Vec::new();

    if let Ok(entries) = fs::read_dir(repo_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if is_temp_path(&path) {
                continue;
            }
            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string();
                    match ext.to_lowercase().as_str() {
                        "iso" => images.push(DiskImage::Iso { name, path: path.clone(), size }),
                        "bin" if is_imageusb_image(&path).unwrap_or(false) => {
                            images.push(DiskImage::ImageUsbBin { name, path: path.clone(), size })
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    for subdir in ["clonezilla", "images"] {
        let candidate = repo_root.join(subdir);
        if candidate.is_dir() {
            images.extend(list_clonezilla_dirs(&candidate));
        }
    }
    images.extend(list_clonezilla_dirs(repo_root));

    images
}

fn list_clonezilla_dirs(root: &Path) -> Vec<DiskImage> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || is_temp_path(&path) {
            continue;
        }
        if !path.join("parts").exists() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let parts = fs::read_to_string(path.join("parts"))
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let partition_table_file = find_partition_table_file(&path).map(|(_, file)| file);
        let compressed = fs::read_dir(&path)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().ends_with(".gz"))
            })
            .unwrap_or(false);
        out.push(DiskImage::ClonezillaDir {
            name,
            path,
            parts,
            partition_table_file,
            compressed,
        });
    }
    out
}

/// Accounts for space used on the repo's filesystem, broken down by image
/// type, via `statvfs` on the repo root plus a directory walk for the
/// per-type breakdown.
pub fn get_repo_usage(repo: &ImageRepo) -> RepoUsage {
    let mut usage = RepoUsage::default();

    if let Ok(stat) = nix_statvfs(&repo.path) {
        usage.total_bytes = stat.0;
        usage.free_bytes = stat.1;
        usage.used_bytes = usage.total_bytes.saturating_sub(usage.free_bytes);
    }

    let mut iso_bytes = 0u64;
    let mut bin_bytes = 0u64;
    let mut cz_bytes = 0u64;
    for image in list_images(&repo.path) {
        match &image {
            DiskImage::Iso { size, .. } => iso_bytes += size,
            DiskImage::ImageUsbBin { size, .. } => bin_bytes += size,
            DiskImage::ClonezillaDir { path, .. } => cz_bytes += sum_tree_bytes(path),
        }
    }
    usage.by_type.insert("iso", iso_bytes);
    usage.by_type.insert("imageusb", bin_bytes);
    usage.by_type.insert("clonezilla", cz_bytes);
    let typed: u64 = usage.by_type.values().sum();
    usage
        .by_type
        .insert("other", usage.used_bytes.saturating_sub(typed));

    debug!("repo usage for {:?}: {:?}", repo.path, usage);
    usage
}

/// Returns `(total_bytes, free_bytes)` for the filesystem backing `path`.
fn nix_statvfs(path: &Path) -> std::io::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    let frsize = stat.fragment_size();
    Ok((frsize * stat.blocks(), frsize * stat.blocks_available()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;

    const IMAGEUSB_SIGNATURE: [u8; 16] = [
        0x69, 0x00, 0x6D, 0x00, 0x61, 0x00, 0x67, 0x00, 0x65, 0x00, 0x55, 0x00, 0x53, 0x00, 0x42, 0x00,
    ];

    #[test]
    fn list_images_finds_iso_and_bin_at_root() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("ubuntu.iso")).unwrap();
        let mut bin = File::create(dir.path().join("backup.bin")).unwrap();
        bin.write_all(&IMAGEUSB_SIGNATURE).unwrap();
        bin.write_all(&[0u8; 1024]).unwrap();
        let images = list_images(dir.path());
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn list_images_rejects_bin_without_imageusb_signature() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("not-really-imageusb.bin")).unwrap();
        let images = list_images(dir.path());
        assert!(images.is_empty());
    }

    #[test]
    fn list_images_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("partial.iso.tmp")).unwrap();
        let images = list_images(dir.path());
        assert!(images.is_empty());
    }

    #[test]
    fn list_images_finds_clonezilla_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cz = dir.path().join("clonezilla").join("my-image");
        fs::create_dir_all(&cz).unwrap();
        let mut parts = File::create(cz.join("parts")).unwrap();
        writeln!(parts, "sda1 sda2").unwrap();
        File::create(cz.join("my-image-pt.sf")).unwrap();
        let images = list_images(dir.path());
        assert_eq!(images.len(), 1);
        match &images[0] {
            DiskImage::ClonezillaDir { parts, partition_table_file, .. } => {
                assert_eq!(parts, &vec!["sda1".to_string(), "sda2".to_string()]);
                assert!(partition_table_file.is_some());
            }
            _ => panic!("expected clonezilla dir"),
        }
    }

    #[test]
    fn list_images_matches_partition_table_by_source_disk_not_dir_name() {
        let dir = tempfile::tempdir().unwrap();
        let cz = dir.path().join("clonezilla").join("2026-07-20-backup");
        fs::create_dir_all(&cz).unwrap();
        let mut parts = File::create(cz.join("parts")).unwrap();
        writeln!(parts, "sda1").unwrap();
        File::create(cz.join("sda-pt.sgdisk")).unwrap();
        let images = list_images(dir.path());
        match &images[0] {
            DiskImage::ClonezillaDir { partition_table_file, .. } => {
                assert!(partition_table_file.is_some());
            }
            _ => panic!("expected clonezilla dir"),
        }
    }
}
