use thiserror::Error;

use crate::types::ConnectionState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store i/o failed: {0}")]
    Io(String),
    #[error("credential record is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("region `{label}` exhausted ({capacity} bytes)")]
    RegionExhausted { label: String, capacity: u32 },
    #[error("flash fault: {0}")]
    Flash(String),
    #[error("image validation failed: {0}")]
    Validation(String),
    #[error("boot pointer update failed: {0}")]
    BootPointer(String),
}

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(&'static str),
    #[error("station connection retries exhausted")]
    ConnectRetriesExhausted,
    #[error("connectivity manager is not initialized")]
    NotInitialized,
    #[error("cannot change network mode from {}", from.as_str())]
    InvalidTransition { from: ConnectionState },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("network driver error: {0}")]
    Driver(String),
    #[error("timed out waiting for station connection")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an update session is already in progress")]
    Busy,
    #[error("no update session has been started")]
    NotStarted,
    #[error("no update session is in progress")]
    NotInProgress,
    #[error("no inactive storage region available")]
    NoTargetRegion,
    #[error("invalid image size {size} (region capacity {capacity})")]
    InvalidSize { size: u32, capacity: u32 },
    #[error("sha256 must be 64 hex characters")]
    InvalidDigest,
    #[error("firmware write failed: {0}")]
    WriteError(#[source] StorageError),
    #[error("firmware commit failed: {0}")]
    CommitError(String),
}
