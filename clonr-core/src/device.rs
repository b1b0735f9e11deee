use std::fmt;
use std::path::PathBuf;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A whole physical disk discovered on the system.
///
/// Disks are produced by [`crate::catalog::Catalog::refresh`] and are part of an
/// immutable [`crate::catalog::Snapshot`]; nothing in the library mutates them
/// after the snapshot is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalDisk {
    /// The OS-assigned index, unique within one snapshot and stable for the boot session.
    pub index: u32,
    /// Vendor/model string. Empty when the host does not report one.
    pub model: String,
    /// Capacity in bytes. Zero when the host could not report a size.
    pub size_bytes: u64,
    /// Bus or transport tag (e.g. "usb", "nvme", "SCSI"). Informational only.
    pub interface_type: String,
    /// The raw whole-device path (e.g. `/dev/sda` or `\\.\PhysicalDrive0`).
    pub path: PathBuf,
    /// Volumes living on this disk, in the order the host reported them.
    pub partitions: Vec<Partition>,
}

/// A logical volume on a physical disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Drive letter, mount point or volume id. `None` for unmounted volumes.
    pub id: Option<String>,
    pub size_bytes: u64,
    /// Always `<= size_bytes`.
    pub free_bytes: u64,
    /// Index of the owning [`PhysicalDisk`].
    pub owner_index: u32,
}

impl PhysicalDisk {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / GIB
    }

    /// The model string, or a placeholder for display when the host reported none.
    pub fn display_model(&self) -> &str {
        if self.model.is_empty() {
            "(no model reported)"
        } else {
            &self.model
        }
    }
}

impl Partition {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / GIB
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }
}

impl fmt::Display for PhysicalDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:<20} {:>8.1} GB  {:<25} {}",
            self.index,
            self.path.display(),
            self.size_gb(),
            self.display_model(),
            self.interface_type
        )
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.as_deref().unwrap_or("(not mounted)");
        write!(
            f,
            "{:<20} {:>8.1} GB  {:.1} GB free",
            id,
            self.size_gb(),
            self.free_gb()
        )
    }
}
