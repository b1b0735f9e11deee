//! Builds a cross-referenced inventory of physical disks and their volumes.
//!
//! The host is queried through a [`DeviceSource`], which reports disks and
//! volumes as flat records. [`Catalog::refresh`] joins the two lists into a
//! [`Snapshot`], attaching each volume to the disk whose index the host reported
//! as its owner. Volumes are never matched to disks by size or model: when the
//! owner index names no enumerated disk, the volume is kept aside in
//! [`Snapshot::unattributed`] so the caller can see it.

use crate::device::{Partition, PhysicalDisk};
use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A physical disk as reported by the host, before correlation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskRecord {
    pub index: u32,
    pub model: String,
    pub size_bytes: u64,
    pub interface_type: String,
    pub path: PathBuf,
}

/// A logical volume as reported by the host, before correlation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRecord {
    pub id: Option<String>,
    pub size_bytes: u64,
    pub free_bytes: u64,
    /// The physical disk index the OS says this volume lives on.
    pub owner_index: u32,
}

/// A host capability able to enumerate disks and volumes.
///
/// Implementations return [`Error::CatalogUnavailable`] when the underlying
/// interface cannot be reached at all, and an empty list when it is reachable
/// but reports nothing.
pub trait DeviceSource {
    fn physical_disks(&self) -> Result<Vec<DiskRecord>>;
    fn volumes(&self) -> Result<Vec<VolumeRecord>>;
}

impl<S: DeviceSource + ?Sized> DeviceSource for &S {
    fn physical_disks(&self) -> Result<Vec<DiskRecord>> {
        (**self).physical_disks()
    }

    fn volumes(&self) -> Result<Vec<VolumeRecord>> {
        (**self).volumes()
    }
}

/// An immutable view of the host's disks at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    disks: Vec<PhysicalDisk>,
    unattributed: Vec<Partition>,
}

impl Snapshot {
    /// Disks ordered by index.
    pub fn disks(&self) -> &[PhysicalDisk] {
        &self.disks
    }

    pub fn disk(&self, index: u32) -> Option<&PhysicalDisk> {
        self.disks
            .binary_search_by_key(&index, |d| d.index)
            .ok()
            .map(|pos| &self.disks[pos])
    }

    /// Volumes whose reported owner is not among the enumerated disks.
    pub fn unattributed(&self) -> &[Partition] {
        &self.unattributed
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }
}

/// Produces [`Snapshot`]s from a [`DeviceSource`].
pub struct Catalog<S> {
    source: S,
}

impl<S: DeviceSource> Catalog<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Queries the host and builds a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatalogUnavailable`] if either enumeration fails, or if
    /// the host reports the same disk index twice. No partial snapshot is ever
    /// returned.
    pub fn refresh(&self) -> Result<Snapshot> {
        let disks = self.source.physical_disks()?;
        let volumes = self.source.volumes()?;
        let snapshot = correlate(disks, volumes)?;
        info!(
            "Device refresh found {} disk(s), {} unattributed volume(s)",
            snapshot.disks.len(),
            snapshot.unattributed.len()
        );
        Ok(snapshot)
    }
}

/// Joins host records into a snapshot by owner index.
pub fn correlate(disks: Vec<DiskRecord>, volumes: Vec<VolumeRecord>) -> Result<Snapshot> {
    let mut by_index: BTreeMap<u32, PhysicalDisk> = BTreeMap::new();
    for record in disks {
        if record.size_bytes == 0 {
            debug!("Disk {} reports no size", record.index);
        }
        let index = record.index;
        let disk = PhysicalDisk {
            index,
            model: record.model,
            size_bytes: record.size_bytes,
            interface_type: record.interface_type,
            path: record.path,
            partitions: Vec::new(),
        };
        if by_index.insert(index, disk).is_some() {
            return Err(Error::CatalogUnavailable(format!(
                "host reported disk index {index} more than once"
            )));
        }
    }

    let mut unattributed = Vec::new();
    for volume in volumes {
        let free_bytes = if volume.free_bytes > volume.size_bytes {
            warn!(
                "Volume {:?} reports {} free of {} bytes; clamping",
                volume.id, volume.free_bytes, volume.size_bytes
            );
            volume.size_bytes
        } else {
            volume.free_bytes
        };
        let partition = Partition {
            id: volume.id,
            size_bytes: volume.size_bytes,
            free_bytes,
            owner_index: volume.owner_index,
        };
        match by_index.get_mut(&partition.owner_index) {
            Some(disk) => disk.partitions.push(partition),
            None => {
                warn!(
                    "Volume {:?} names disk {} which was not enumerated",
                    partition.id, partition.owner_index
                );
                unattributed.push(partition);
            }
        }
    }

    Ok(Snapshot {
        disks: by_index.into_values().collect(),
        unattributed,
    })
}
