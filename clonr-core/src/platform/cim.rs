//! Parsing of the JSON PowerShell prints for CIM disk and volume queries.
//!
//! `ConvertTo-Json` prints a bare object for a single result, an array for
//! several, and nothing at all for none; all three are accepted.

use crate::catalog::{DiskRecord, VolumeRecord};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskDrive {
    index: u32,
    model: Option<String>,
    size: Option<u64>,
    interface_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Volume {
    disk_number: u32,
    drive_letter: Option<String>,
    size: Option<u64>,
    size_remaining: Option<u64>,
    drive_type: Option<String>,
}

fn parse_list<T: DeserializeOwned>(json: &str, what: &str) -> Result<Vec<T>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany<T> = serde_json::from_str(json)
        .map_err(|e| Error::CatalogUnavailable(format!("unreadable {what} list: {e}")))?;
    Ok(match parsed {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}

pub(crate) fn raw_disk_path(index: u32) -> PathBuf {
    PathBuf::from(format!(r"\\.\PhysicalDrive{index}"))
}

/// Parses `Win32_DiskDrive` rows (Index, Model, Size, InterfaceType).
pub(crate) fn parse_disk_drives(json: &str) -> Result<Vec<DiskRecord>> {
    Ok(parse_list::<DiskDrive>(json, "disk")?
        .into_iter()
        .map(|d| DiskRecord {
            index: d.index,
            model: d.model.map(|m| m.trim().to_string()).unwrap_or_default(),
            size_bytes: d.size.unwrap_or(0),
            interface_type: d.interface_type.unwrap_or_default(),
            path: raw_disk_path(d.index),
        })
        .collect())
}

/// Parses partition/volume rows, keeping fixed (or untyped) ones.
///
/// A volume without a drive letter is still listed, with `id` set to `None`.
pub(crate) fn parse_volumes(json: &str) -> Result<Vec<VolumeRecord>> {
    Ok(parse_list::<Volume>(json, "volume")?
        .into_iter()
        .filter(|v| v.drive_type.as_deref().is_none_or(|t| t == "Fixed"))
        .map(|v| VolumeRecord {
            id: v
                .drive_letter
                .map(|l| {
                    // A partition without a letter reports the NUL char.
                    l.trim_matches(|c: char| c.is_whitespace() || c == '\0' || c == ':')
                        .to_string()
                })
                .filter(|l| !l.is_empty())
                .map(|l| format!("{l}:")),
            size_bytes: v.size.unwrap_or(0),
            free_bytes: v.size_remaining.unwrap_or(0),
            owner_index: v.disk_number,
        })
        .collect())
}
