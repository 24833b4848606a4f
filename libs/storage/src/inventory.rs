//! Block device inventory via `lsblk --json`, with a short-lived cache so
//! callers listing, classifying, and validating drives in quick succession
//! don't each pay for a fresh `lsblk` invocation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;

use crate::error::DeviceError;
use crate::runner::CommandRunner;

/// Mountpoints that mark a drive as hosting the running OS.
pub const ROOT_MOUNTPOINTS: [&str; 3] = ["/", "/boot", "/boot/firmware"];

const LSBLK_COLUMNS: &str = "NAME,TYPE,SIZE,MODEL,VENDOR,TRAN,RM,MOUNTPOINT,\
FSTYPE,LABEL,SERIAL,PTTYPE,ROTA,PTUUID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Nvme,
    Mmc,
    Other(String),
}

impl From<&str> for Transport {
    fn from(value: &str) -> Self {
        match value {
            "usb" => Transport::Usb,
            "nvme" => Transport::Nvme,
            "mmc" => Transport::Mmc,
            other => Transport::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Gpt,
    Mbr,
    None,
}

impl From<Option<&str>> for PartitionTable {
    fn from(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("gpt") => PartitionTable::Gpt,
            Some("dos") | Some("mbr") | Some("msdos") => PartitionTable::Mbr,
            _ => PartitionTable::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveClass {
    System,
    Media,
    Other,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub fstype: Option<String>,
    pub fs_label: Option<String>,
    pub mountpoint: Option<PathBuf>,
    pub partition_number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Drive {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub rotational: bool,
    pub removable: bool,
    pub transport: Transport,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub table: PartitionTable,
    pub partitions: Vec<Partition>,
}

impl Drive {
    /// True if any partition (or the drive itself) is mounted at a known
    /// OS root mountpoint.
    pub fn has_root_mountpoint(&self) -> bool {
        self.partitions.iter().any(|p| {
            p.mountpoint
                .as_deref()
                .and_then(|m| m.to_str())
                .is_some_and(|m| ROOT_MOUNTPOINTS.contains(&m))
        })
    }

    pub fn active_mountpoints(&self) -> Vec<PathBuf> {
        self.partitions
            .iter()
            .filter_map(|p| p.mountpoint.clone())
            .collect()
    }
}

/// Strips the partition suffix off a device name, per-transport.
///
/// `nvme0n1p2 -> nvme0n1`, `mmcblk0p1 -> mmcblk0`, `sda1 -> sda`. A name with
/// no trailing digits (or that is already a base device) is returned as-is.
pub fn base_device(name: &str) -> String {
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        return match name.rfind('p') {
            Some(idx) if name[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < name.len() => {
                name[..idx].to_string()
            }
            _ => name.to_string(),
        };
    }
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.is_empty() || trimmed == name {
        name.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extracts the partition number from a partition device name given its
/// parent's base name, e.g. `("sda1", "sda") -> Some(1)`,
/// `("nvme0n1p3", "nvme0n1") -> Some(3)`.
pub fn partition_number(name: &str, parent: &str) -> Option<u32> {
    name.strip_prefix(parent)
        .map(|rest| rest.trim_start_matches('p'))
        .and_then(|digits| digits.parse().ok())
}

#[derive(Debug, Deserialize)]
struct LsblkRoot {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    size: Option<serde_json::Value>,
    model: Option<String>,
    vendor: Option<String>,
    tran: Option<String>,
    #[serde(default, deserialize_with = "bool_like")]
    rm: bool,
    mountpoint: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    serial: Option<String>,
    pttype: Option<String>,
    #[serde(default, deserialize_with = "bool_like")]
    rota: bool,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

fn bool_like<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    Ok(match v {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

fn size_to_bytes(v: &Option<serde_json::Value>) -> u64 {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn node_to_drive(node: &LsblkNode) -> Drive {
    let partitions = node
        .children
        .iter()
        .map(|child| Partition {
            name: child.name.clone(),
            path: PathBuf::from(format!("/dev/{}", child.name)),
            size_bytes: size_to_bytes(&child.size),
            fstype: child.fstype.clone(),
            fs_label: child.label.clone(),
            mountpoint: child.mountpoint.clone().map(PathBuf::from),
            partition_number: partition_number(&child.name, &node.name),
        })
        .collect();

    Drive {
        name: node.name.clone(),
        path: PathBuf::from(format!("/dev/{}", node.name)),
        size_bytes: size_to_bytes(&node.size),
        rotational: node.rota,
        removable: node.rm,
        transport: node.tran.as_deref().unwrap_or("").into(),
        vendor: node.vendor.clone(),
        model: node.model.clone(),
        serial: node.serial.clone(),
        table: PartitionTable::from(node.pttype.as_deref()),
        partitions,
    }
}

/// Caching front end over `lsblk`.
pub struct Inventory {
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Drive>)>>,
}

impl Inventory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Returns every block device lsblk reports, refreshing the cache if it
    /// has aged past the TTL or `force_refresh` is set.
    ///
    /// If a refresh fails, the previous snapshot is returned (stale) rather
    /// than propagating the error, unless there is no prior snapshot at all.
    pub fn snapshot(&self, force_refresh: bool) -> Result<Vec<Drive>, DeviceError> {
        let mut guard = self.cache.lock().unwrap();
        let needs_refresh = force_refresh
            || guard
                .as_ref()
                .is_none_or(|(fetched, _)| fetched.elapsed() > self.ttl);

        if !needs_refresh {
            return Ok(guard.as_ref().unwrap().1.clone());
        }

        match fetch_lsblk() {
            Ok(drives) => {
                *guard = Some((Instant::now(), drives.clone()));
                Ok(drives)
            }
            Err(e) => {
                if let Some((_, stale)) = guard.as_ref() {
                    warn!("lsblk refresh failed ({e}), serving stale inventory");
                    Ok(stale.clone())
                } else {
                    Err(DeviceError::NotFound(format!("lsblk failed: {e}")))
                }
            }
        }
    }

    pub fn classify(&self, drive: &Drive) -> DriveClass {
        if drive.has_root_mountpoint() {
            DriveClass::System
        } else if drive.removable
            || matches!(drive.transport, Transport::Usb | Transport::Mmc)
        {
            DriveClass::Media
        } else {
            DriveClass::Other
        }
    }

    /// Media-class drives, excluding any drive tagged as hosting an image
    /// repository (the caller passes in the set of repo-owning drive names,
    /// since that check belongs to the image repository module).
    pub fn list_media_drives(
        &self,
        force_refresh: bool,
        repo_owned: &HashSet<String>,
    ) -> Result<Vec<Drive>, DeviceError> {
        let drives = self.snapshot(force_refresh)?;
        Ok(drives
            .into_iter()
            .filter(|d| self.classify(d) == DriveClass::Media && !repo_owned.contains(&d.name))
            .collect())
    }

    pub fn get_by_name(&self, name: &str, force_refresh: bool) -> Option<Drive> {
        self.snapshot(force_refresh)
            .ok()?
            .into_iter()
            .find(|d| d.name == name)
    }
}

fn fetch_lsblk() -> Result<Vec<Drive>, anyhow::Error> {
    let out = CommandRunner::run_checked(
        &["lsblk", "-J", "-b", "-o", LSBLK_COLUMNS],
        None,
    )?;
    let parsed: LsblkRoot = serde_json::from_str(&out)?;
    debug!("lsblk returned {} top-level devices", parsed.blockdevices.len());
    Ok(parsed
        .blockdevices
        .iter()
        .filter(|n| n.kind.as_deref() == Some("disk"))
        .map(node_to_drive)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_device_strips_plain_suffix() {
        assert_eq!(base_device("sda1"), "sda");
        assert_eq!(base_device("sda"), "sda");
    }

    #[test]
    fn base_device_strips_nvme_suffix() {
        assert_eq!(base_device("nvme0n1p2"), "nvme0n1");
    }

    #[test]
    fn base_device_strips_mmc_suffix() {
        assert_eq!(base_device("mmcblk0p1"), "mmcblk0");
        assert_eq!(base_device("mmcblk0"), "mmcblk0");
    }

    #[test]
    fn partition_number_parses_plain_and_p_prefixed() {
        assert_eq!(partition_number("sda1", "sda"), Some(1));
        assert_eq!(partition_number("nvme0n1p3", "nvme0n1"), Some(3));
    }

    #[test]
    fn classify_system_drive_by_root_mountpoint() {
        let inventory = Inventory::new(Duration::from_secs(1));
        let drive = Drive {
            name: "mmcblk0".into(),
            path: "/dev/mmcblk0".into(),
            size_bytes: 0,
            rotational: false,
            removable: false,
            transport: Transport::Mmc,
            vendor: None,
            model: None,
            serial: None,
            table: PartitionTable::Mbr,
            partitions: vec![Partition {
                name: "mmcblk0p2".into(),
                path: "/dev/mmcblk0p2".into(),
                size_bytes: 0,
                fstype: Some("ext4".into()),
                fs_label: None,
                mountpoint: Some("/".into()),
                partition_number: Some(2),
            }],
        };
        assert_eq!(inventory.classify(&drive), DriveClass::System);
    }

    #[test]
    fn lsblk_rm_field_accepts_numeric_or_boolean() {
        let json = r#"{"blockdevices":[
            {"name":"sda","type":"disk","size":"1000","rm":"1","rota":"0","children":[]},
            {"name":"sdb","type":"disk","size":1000,"rm":true,"rota":false,"children":[]}
        ]}"#;
        let parsed: LsblkRoot = serde_json::from_str(json).unwrap();
        assert!(parsed.blockdevices[0].rm);
        assert!(parsed.blockdevices[1].rm);
    }
}
