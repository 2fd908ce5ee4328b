use std::io;

/// Errors produced by lock acquisition and release.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The resource is already locked (the marker file exists).
    ///
    /// This is a conflict, not a fault: callers may wait and retry.
    #[error("resource is locked: {resource}")]
    Locked { resource: String },

    /// Release was attempted for a resource with no live marker.
    #[error("lock not held: {resource}")]
    NotHeld { resource: String },

    /// The resource name cannot be used as a marker file name.
    #[error("invalid lock resource {name:?}: {reason}")]
    InvalidResource { name: String, reason: String },

    /// I/O failure while creating or removing the marker.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the locking crate.
pub type Result<T> = std::result::Result<T, LockError>;
