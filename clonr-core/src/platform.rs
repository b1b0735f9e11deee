//! Provides platform-specific functionality.
//!
//! This module contains the logic for asking the operating system which
//! physical disks and volumes exist. Each submodule exposes a `HostDevices`
//! type implementing [`crate::catalog::DeviceSource`], so the rest of the
//! library can build snapshots without caring about the underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(any(target_os = "windows", test))]
mod cim;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
