//! Copying images from one location (e.g. a newly inserted repo, or a
//! Clonezilla capture target) into an image repository on this host.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use log::warn;

use crate::repo::{DiskImage, ImageRepo};
use crate::runner::{ProgressFrame, ProgressSink};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Copies each image in `images` into `dest`, continuing past per-image
/// failures. Returns `(success_count, failure_count)`.
pub fn copy_images_to_repo(
    images: &[DiskImage],
    dest: &ImageRepo,
    sink: &mut dyn ProgressSink,
) -> (usize, usize) {
    if !dest.path.is_dir() {
        warn!("destination repo {:?} is not a directory", dest.path);
        return (0, images.len());
    }

    let mut ok = 0;
    let mut failed = 0;
    for image in images {
        let result = match image {
            DiskImage::Iso { .. } | DiskImage::ImageUsbBin { .. } => {
                copy_single_file(image, &dest.path, sink)
            }
            DiskImage::ClonezillaDir { .. } => copy_clonezilla_dir(image, dest, sink),
        };
        match result {
            Ok(()) => ok += 1,
            Err(e) => {
                warn!("failed to copy {}: {e}", image.name());
                failed += 1;
            }
        }
    }
    (ok, failed)
}

fn copy_single_file(
    image: &DiskImage,
    dest_root: &Path,
    sink: &mut dyn ProgressSink,
) -> std::io::Result<()> {
    let dest_path = dest_root.join(image.name());
    if dest_path.exists() {
        warn!("overwriting existing image at {dest_path:?}");
    }
    copy_with_progress(image.path(), &dest_path, &format!("Copying {}", image.name()), sink)
}

fn copy_clonezilla_dir(
    image: &DiskImage,
    dest: &ImageRepo,
    sink: &mut dyn ProgressSink,
) -> std::io::Result<()> {
    let DiskImage::ClonezillaDir { name, path, .. } = image else {
        unreachable!("only called for ClonezillaDir variants");
    };
    let dest_dir = dest.path.join("clonezilla").join(name);
    if dest_dir.exists() {
        warn!("merging into existing Clonezilla image at {dest_dir:?}");
    }
    fs::create_dir_all(&dest_dir)?;

    let entries: Vec<_> = fs::read_dir(path)?.flatten().collect();
    let total: u64 = entries
        .iter()
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    sink.emit(ProgressFrame {
        lines: vec![format!("Copying {name}")],
        ratio: None,
    });
    let mut done = 0u64;
    for entry in entries {
        let src_file = entry.path();
        let Some(file_name) = src_file.file_name() else { continue };
        let dest_file = dest_dir.join(file_name);
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        fs::copy(&src_file, &dest_file)?;
        done += size;
        let ratio = if total > 0 { (done as f64 / total as f64).clamp(0.0, 1.0) } else { 1.0 };
        sink.emit(ProgressFrame {
            lines: vec![format!("Copied {}", src_file.display())],
            ratio: Some(ratio),
        });
    }
    Ok(())
}

fn copy_with_progress(
    src: &Path,
    dst: &Path,
    title: &str,
    sink: &mut dyn ProgressSink,
) -> std::io::Result<()> {
    let total = fs::metadata(src)?.len();
    sink.emit(ProgressFrame {
        lines: vec![title.to_string()],
        ratio: None,
    });

    let mut reader = fs::File::open(src)?;
    let mut writer = fs::File::create(dst)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        done += n as u64;
        let ratio = if total > 0 { (done as f64 / total as f64).clamp(0.0, 1.0) } else { 1.0 };
        sink.emit(ProgressFrame {
            lines: vec![title.to_string()],
            ratio: Some(ratio),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_non_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("file.txt");
        fs::write(&not_a_dir, b"x").unwrap();
        let dest = ImageRepo {
            path: not_a_dir,
            drive_name: "sdb".into(),
        };
        let images = vec![DiskImage::Iso {
            name: "a.iso".into(),
            path: dir.path().join("a.iso"),
            size: 0,
        }];
        let mut sink: Vec<ProgressFrame> = Vec::new();
        let (ok, failed) = copy_images_to_repo(&images, &dest, &mut sink);
        assert_eq!(ok, 0);
        assert_eq!(failed, 1);
    }

    #[test]
    fn copies_single_iso_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let iso_path = src_dir.path().join("a.iso");
        fs::write(&iso_path, vec![0u8; 4096]).unwrap();

        let dest = ImageRepo {
            path: dest_dir.path().to_path_buf(),
            drive_name: "sdb".into(),
        };
        let images = vec![DiskImage::Iso {
            name: "a.iso".into(),
            path: iso_path,
            size: 4096,
        }];
        let mut sink: Vec<ProgressFrame> = Vec::new();
        let (ok, failed) = copy_images_to_repo(&images, &dest, &mut sink);
        assert_eq!(ok, 1);
        assert_eq!(failed, 0);
        assert!(dest_dir.path().join("a.iso").exists());
    }
}
