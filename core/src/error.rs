//! Drive emulation error taxonomy

use std::path::PathBuf;

use thiserror::Error;

use crate::filesystem::MountState;

/// Errors surfaced by the drive emulation core.
///
/// None of these are fatal: bus errors are recovered by the reset path,
/// storage and link errors fail only the operation that raised them.
#[derive(Error, Debug)]
pub enum DriveError {
    /// The host stopped acknowledging within the handshake spin limit
    #[error("Bus handshake timed out after {transferred} bytes")]
    BusTimeout { transferred: usize },

    /// The host asserted RST during (or before) the transfer
    #[error("Bus reset during transfer after {transferred} bytes")]
    BusReset { transferred: usize },

    /// The companion did not answer in time
    #[error("Remote link timed out")]
    RemoteLinkTimeout,

    /// The companion answered, but not with something usable
    #[error("Remote link error: {0}")]
    RemoteLinkError(String),

    #[error("Storage object not found: {}", .0.display())]
    StorageNotFound(PathBuf),

    #[error("Image {} has unsupported size {size} bytes", .path.display())]
    StorageSizeInvalid { path: PathBuf, size: u64 },

    #[error(
        "Image {} is {actual} bytes but its descriptor describes {described} bytes",
        .path.display()
    )]
    StorageSizeInconsistent {
        path: PathBuf,
        actual: u64,
        described: u64,
    },

    #[error("File system is already {0}")]
    MountStateConflict(MountState),

    #[error("Sector session: {0}")]
    SessionConflict(&'static str),

    #[error("LUN {0} out of range")]
    InvalidLun(u8),

    #[error("Storage I/O error: {0}")]
    Storage(#[from] std::io::Error),
}

impl DriveError {
    /// True for the conditions the orchestrator resolves by running a full
    /// host reset.
    pub fn is_bus_abort(&self) -> bool {
        matches!(self, Self::BusTimeout { .. } | Self::BusReset { .. })
    }
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_aborts() {
        assert!(DriveError::BusTimeout { transferred: 3 }.is_bus_abort());
        assert!(DriveError::BusReset { transferred: 0 }.is_bus_abort());
        assert!(!DriveError::RemoteLinkTimeout.is_bus_abort());
        assert!(!DriveError::StorageNotFound(PathBuf::from("scsi0.dat")).is_bus_abort());
    }
}
