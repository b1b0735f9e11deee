use crate::catalog::{DeviceSource, DiskRecord, VolumeRecord};
use crate::error::{Error, Result};
use log::debug;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// The kernel reports `size` in 512-byte sectors regardless of the device's block size.
const SECTOR_SIZE: u64 = 512;

/// Virtual and non-disk block devices that never take part in a clone.
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "fd", "nbd"];

/// Usage figures for one mounted block device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountUsage {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Enumerates disks from `/sys/block` and mount usage from `sysinfo`.
///
/// `volumes()` reuses the disk list read by the preceding `physical_disks()`
/// call, so both halves of one refresh agree on disk indices even when disks
/// appear or vanish in between.
#[derive(Debug)]
pub struct SysfsDevices {
    sys_block: PathBuf,
    dev_dir: PathBuf,
    mounts: Option<Vec<MountUsage>>,
    last_scan: Mutex<Option<Vec<ScannedDisk>>>,
}

pub type HostDevices = SysfsDevices;

impl Default for SysfsDevices {
    fn default() -> Self {
        Self::new()
    }
}

/// A whole disk found under `/sys/block`.
#[derive(Debug)]
struct ScannedDisk {
    name: String,
    record: DiskRecord,
}

impl SysfsDevices {
    pub fn new() -> Self {
        Self::at("/sys/block", "/dev")
    }

    /// Reads a sysfs tree rooted somewhere other than `/sys/block`.
    pub fn at(sys_block: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
            mounts: None,
            last_scan: Mutex::new(None),
        }
    }

    /// Uses a fixed mount table instead of querying the live system.
    pub fn with_mounts(mut self, mounts: Vec<MountUsage>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    fn read_attr(&self, device: &str, attr: &str) -> io::Result<String> {
        fs::read_to_string(self.sys_block.join(device).join(attr)).map(|s| s.trim().to_string())
    }

    fn scan_disks(&self) -> Result<Vec<ScannedDisk>> {
        let entries = fs::read_dir(&self.sys_block).map_err(|e| {
            Error::CatalogUnavailable(format!("cannot read {}: {e}", self.sys_block.display()))
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| !SKIPPED_PREFIXES.iter().any(|p| name.starts_with(p)))
            .collect();
        names.sort();

        // diskseq is the kernel's per-boot disk number. Without it on every disk
        // the only stable choice is ordinal position by kernel name.
        let indices: Vec<u32> = names
            .iter()
            .map(|name| {
                self.read_attr(name, "diskseq")
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
            })
            .collect::<Option<Vec<u32>>>()
            .unwrap_or_else(|| {
                debug!("diskseq not available for every disk, numbering by name");
                (0..names.len() as u32).collect()
            });

        let disks = names
            .into_iter()
            .zip(indices)
            .map(|(name, index)| {
                let size_sectors = self
                    .read_attr(&name, "size")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let model = self.read_attr(&name, "device/model").unwrap_or_default();
                let record = DiskRecord {
                    index,
                    model,
                    size_bytes: size_sectors * SECTOR_SIZE,
                    interface_type: self.detect_transport(&name),
                    path: self.dev_dir.join(&name),
                };
                debug!("Found disk {name} as index {index}");
                ScannedDisk { name, record }
            })
            .collect();
        Ok(disks)
    }

    /// Guesses the bus from where the `device` link of a disk resolves to.
    fn detect_transport(&self, device: &str) -> String {
        let Ok(real) = fs::canonicalize(self.sys_block.join(device).join("device")) else {
            return "unknown".to_string();
        };
        let real = real.to_string_lossy();
        let transport = if real.contains("/usb") {
            "usb"
        } else if real.contains("nvme") {
            "nvme"
        } else if real.contains("mmc") {
            "mmc"
        } else if real.contains("virtio") {
            "virtio"
        } else if real.contains("/ata") {
            "ata"
        } else if real.contains("/host") {
            "scsi"
        } else {
            "unknown"
        };
        transport.to_string()
    }

    /// Partitions of `disk`, in partition-number order.
    fn scan_partitions(
        &self,
        disk: &ScannedDisk,
        mounts: &[MountUsage],
    ) -> Result<Vec<VolumeRecord>> {
        let dir = self.sys_block.join(&disk.name);
        let entries = fs::read_dir(&dir).map_err(|e| {
            Error::CatalogUnavailable(format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut parts: Vec<(u32, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let number = fs::read_to_string(entry.path().join("partition")).ok()?;
                let number = number.trim().parse::<u32>().ok()?;
                Some((number, entry.file_name().to_string_lossy().to_string()))
            })
            .collect();
        parts.sort();

        let volumes = parts
            .into_iter()
            .map(|(_, name)| {
                let device = self.dev_dir.join(&name);
                match mounts.iter().find(|m| m.device == device) {
                    Some(mount) => VolumeRecord {
                        id: Some(mount.mount_point.to_string_lossy().to_string()),
                        size_bytes: mount.total_bytes,
                        free_bytes: mount.available_bytes,
                        owner_index: disk.record.index,
                    },
                    None => {
                        let sectors = fs::read_to_string(dir.join(&name).join("size"))
                            .ok()
                            .and_then(|s| s.trim().parse::<u64>().ok())
                            .unwrap_or(0);
                        VolumeRecord {
                            id: None,
                            size_bytes: sectors * SECTOR_SIZE,
                            free_bytes: 0,
                            owner_index: disk.record.index,
                        }
                    }
                }
            })
            .collect();
        Ok(volumes)
    }
}

fn live_mounts() -> Vec<MountUsage> {
    sysinfo::Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| MountUsage {
            device: PathBuf::from(disk.name()),
            mount_point: disk.mount_point().to_path_buf(),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
        .collect()
}

impl DeviceSource for SysfsDevices {
    fn physical_disks(&self) -> Result<Vec<DiskRecord>> {
        let scanned = self.scan_disks()?;
        let records = scanned.iter().map(|d| d.record.clone()).collect();
        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = Some(scanned);
        Ok(records)
    }

    fn volumes(&self) -> Result<Vec<VolumeRecord>> {
        let live;
        let mounts: &[MountUsage] = match &self.mounts {
            Some(mounts) => mounts,
            None => {
                live = live_mounts();
                &live
            }
        };

        let cached = self
            .last_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let disks = match cached {
            Some(disks) => disks,
            None => self.scan_disks()?,
        };

        let mut volumes = Vec::new();
        for disk in disks {
            volumes.extend(self.scan_partitions(&disk, mounts)?);
        }
        Ok(volumes)
    }
}
