//! Decides whether a (source, destination) pair may be cloned.
//!
//! [`validate`] turns two disk indices into an approved [`ClonePlan`], or a
//! [`Rejection`] naming the first precondition that failed. The checks run in
//! a fixed order: both disks must exist, they must differ, and the destination
//! must be at least as large as the source unless the caller opts out through
//! [`ValidationOptions::allow_smaller_destination`]. A source whose size the
//! host did not report counts as not fitting.

use crate::catalog::Snapshot;
use crate::device::PhysicalDisk;
use crate::error::Rejection;
use std::fmt;
use std::path::{Path, PathBuf};

/// One side of a clone, captured from the snapshot it was validated against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedDisk {
    pub index: u32,
    pub model: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

impl From<&PhysicalDisk> for PlannedDisk {
    fn from(disk: &PhysicalDisk) -> Self {
        Self {
            index: disk.index,
            model: disk.model.clone(),
            size_bytes: disk.size_bytes,
            path: disk.path.clone(),
        }
    }
}

/// The intent to copy one physical disk onto another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonePlan {
    source: PlannedDisk,
    destination: PlannedDisk,
    approved: bool,
}

impl ClonePlan {
    /// Builds an unapproved plan. Only [`validate`] hands out approved ones.
    pub fn draft(source: &PhysicalDisk, destination: &PhysicalDisk) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            approved: false,
        }
    }

    pub fn source(&self) -> &PlannedDisk {
        &self.source
    }

    pub fn destination(&self) -> &PlannedDisk {
        &self.destination
    }

    pub fn source_index(&self) -> u32 {
        self.source.index
    }

    pub fn destination_index(&self) -> u32 {
        self.destination.index
    }

    pub fn source_path(&self) -> &Path {
        &self.source.path
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination.path
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    /// Bytes the copy must stop at, when the source may not fit the destination.
    ///
    /// `None` means the whole source is copied. A destination of unknown size
    /// gives no limit to go by.
    pub fn copy_limit(&self) -> Option<u64> {
        let fits =
            self.source.size_bytes > 0 && self.destination.size_bytes >= self.source.size_bytes;
        (!fits && self.destination.size_bytes > 0).then_some(self.destination.size_bytes)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Accept a destination smaller than the source. The copy will be truncated.
    pub allow_smaller_destination: bool,
}

/// Validates a clone request with default options.
pub fn validate(
    snapshot: &Snapshot,
    source_index: u32,
    destination_index: u32,
) -> Result<ClonePlan, Rejection> {
    validate_with(
        snapshot,
        source_index,
        destination_index,
        ValidationOptions::default(),
    )
}

/// Validates a clone request, stopping at the first failed check.
pub fn validate_with(
    snapshot: &Snapshot,
    source_index: u32,
    destination_index: u32,
    options: ValidationOptions,
) -> Result<ClonePlan, Rejection> {
    let source = snapshot
        .disk(source_index)
        .ok_or(Rejection::UnknownDevice(source_index))?;
    let destination = snapshot
        .disk(destination_index)
        .ok_or(Rejection::UnknownDevice(destination_index))?;

    if source.index == destination.index {
        return Err(Rejection::SameDevice(source.index));
    }

    // A source of unknown size (reported as 0) cannot be shown to fit anywhere.
    let fits = source.size_bytes > 0 && destination.size_bytes >= source.size_bytes;
    if !fits && !options.allow_smaller_destination {
        return Err(Rejection::CapacityInsufficient {
            source_index: source.index,
            source_bytes: source.size_bytes,
            destination_index: destination.index,
            destination_bytes: destination.size_bytes,
        });
    }

    let mut plan = ClonePlan::draft(source, destination);
    plan.approved = true;
    Ok(plan)
}

/// Proof that an operator explicitly agreed to erase the destination.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    /// Wraps an externally obtained confirmation (e.g. a phrase the operator typed).
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConfirmationToken").finish()
    }
}

/// The warning a front-end must show before executing a plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationPrompt {
    pub message: String,
    destination_index: u32,
}

impl ConfirmationPrompt {
    /// Turns the prompt into a token. Call this only after the operator agreed.
    pub fn accept(self) -> ConfirmationToken {
        ConfirmationToken(format!("erase-disk-{}", self.destination_index))
    }
}

impl fmt::Display for ConfirmationPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Describes the destruction a plan will cause.
pub fn requires_confirmation(plan: &ClonePlan) -> ConfirmationPrompt {
    let src = plan.source();
    let dst = plan.destination();
    let mut message = format!(
        "ALL DATA on disk {} ({}, {}, {} bytes) will be irrecoverably erased and replaced with the contents of disk {} ({}, {}).",
        dst.index,
        dst.path.display(),
        model_or_blank(&dst.model),
        dst.size_bytes,
        src.index,
        src.path.display(),
        model_or_blank(&src.model),
    );
    if src.size_bytes == 0 {
        message.push_str(
            " The size of the source is unknown; the copy will be truncated to fit the destination.",
        );
    } else if dst.size_bytes < src.size_bytes {
        message.push_str(&format!(
            " The destination is {} bytes smaller than the source; the copy will be truncated to its first {} bytes.",
            src.size_bytes - dst.size_bytes,
            dst.size_bytes
        ));
    }
    ConfirmationPrompt {
        message,
        destination_index: dst.index,
    }
}

fn model_or_blank(model: &str) -> &str {
    if model.is_empty() { "no model reported" } else { model }
}
