use super::cim;
use crate::catalog::{DeviceSource, DiskRecord, VolumeRecord};
use crate::error::{Error, Result};
use log::debug;
use std::process::Command;

const DISK_QUERY: &str = "Get-CimInstance -ClassName Win32_DiskDrive | \
    Select-Object Index,Model,Size,InterfaceType | ConvertTo-Json -Compress";

const VOLUME_QUERY: &str = "Get-Partition | ForEach-Object { \
    $v = $_ | Get-Volume -ErrorAction SilentlyContinue; \
    if ($v) { [pscustomobject]@{ \
        DiskNumber = $_.DiskNumber; \
        DriveLetter = [string]$_.DriveLetter; \
        Size = $v.Size; \
        SizeRemaining = $v.SizeRemaining; \
        DriveType = [string]$v.DriveType } } \
    } | ConvertTo-Json -Compress";

/// Enumerates disks and volumes through CIM, via PowerShell.
#[derive(Clone, Debug, Default)]
pub struct CimDevices;

pub type HostDevices = CimDevices;

impl CimDevices {
    pub fn new() -> Self {
        Self
    }
}

fn run_powershell(script: &str) -> Result<String> {
    debug!("Running PowerShell query: {script}");
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| Error::CatalogUnavailable(format!("cannot run powershell: {e}")))?;
    if !output.status.success() {
        return Err(Error::CatalogUnavailable(format!(
            "device query failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl DeviceSource for CimDevices {
    fn physical_disks(&self) -> Result<Vec<DiskRecord>> {
        cim::parse_disk_drives(&run_powershell(DISK_QUERY)?)
    }

    fn volumes(&self) -> Result<Vec<VolumeRecord>> {
        cim::parse_volumes(&run_powershell(VOLUME_QUERY)?)
    }
}
