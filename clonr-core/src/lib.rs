//! The core, UI-agnostic library for the `clonr` disk cloning utility.
//!
//! `clonr-core` is designed to be used as a library by any front-end, whether it's
//! a command-line interface (like `clonr`) or a graphical user interface. It
//! builds an inventory of the host's physical disks, decides whether a clone
//! request is safe, and supervises the external tool that performs the
//! whole-device copy.
//!
//! The library is structured into several key modules:
//! - [`device`]: The `PhysicalDisk` and `Partition` model.
//! - [`catalog`]: Builds immutable snapshots of disks and their volumes,
//!   correlated strictly by the OS-reported owning disk index.
//! - [`platform`]: Host-specific disk and volume enumeration.
//! - [`validate`]: Turns a (source, destination) pair into an approved
//!   `ClonePlan` and produces the confirmation prompt.
//! - [`mod@clone`]: Runs the copy tool on a worker thread and streams its output.
//!
//! Nothing destructive happens without an approved plan *and* a confirmation
//! token, and the elevation check runs inside every `execute` call.
//!
//! ## Example: Cloning with Progress Reporting
//!
//! ```rust,no_run
//! use clonr_core::catalog::Catalog;
//! use clonr_core::clone::{CloneEvent, DdTool, Orchestrator};
//! use clonr_core::platform::HostDevices;
//! use clonr_core::validate::{requires_confirmation, validate};
//!
//! fn main() -> clonr_core::Result<()> {
//!     let snapshot = Catalog::new(HostDevices::new()).refresh()?;
//!     for disk in snapshot.disks() {
//!         println!("{disk}");
//!     }
//!
//!     let plan = validate(&snapshot, 1, 2)?;
//!     let prompt = requires_confirmation(&plan);
//!     println!("{prompt}");
//!     // A real front-end asks the operator here and only accepts on "yes".
//!     let token = prompt.accept();
//!
//!     let orchestrator = Orchestrator::new(DdTool::default());
//!     let session = orchestrator.execute(&plan, Some(token))?;
//!     for event in session {
//!         match event {
//!             CloneEvent::Progress(p) => println!("{}", p.line),
//!             CloneEvent::Finished(report) => report.into_result()?,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod clone;
pub mod device;
mod error;
pub mod platform;
pub mod privilege;
pub mod validate;

pub use error::{Error, Rejection, Result};
