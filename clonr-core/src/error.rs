use thiserror::Error;

/// Why the selection validator refused a (source, destination) pair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("No disk with index {0} in the current device list")]
    UnknownDevice(u32),

    #[error("Source and destination are the same disk (index {0})")]
    SameDevice(u32),

    #[error(
        "Destination disk {destination_index} ({destination_bytes} bytes) is smaller than source disk {source_index} ({source_bytes} bytes)"
    )]
    CapacityInsufficient {
        source_index: u32,
        source_bytes: u64,
        destination_index: u32,
        destination_bytes: u64,
    },
}

/// Error type for every fallible operation of the core library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device enumeration unavailable: {0}")]
    CatalogUnavailable(String),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("Clone plan has not been approved by the validator")]
    NotApproved,

    #[error("Clone requires an explicit confirmation")]
    MissingConfirmation,

    #[error("Cloning requires administrator/root privileges")]
    InsufficientPrivilege,

    #[error("A clone onto disk {0} is already in progress")]
    AlreadyInProgress(u32),

    #[error("Could not launch the copy tool: {0}")]
    LaunchFailed(String),

    #[error("Copy tool failed ({})", explain_exit(.0))]
    ProcessFailed(Option<i32>),

    #[error("Clone cancelled; the destination disk is in an undefined, partially written state")]
    Cancelled,
}

fn explain_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
