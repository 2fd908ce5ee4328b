use std::io;

use wharf_locking::LockError;

/// Errors surfaced by storage operations.
///
/// Each variant is a discriminable kind the host registry can map to its own
/// transport responses (e.g. 404 for `NotFound`, 409 for `AlreadyExists`);
/// this crate never formats user-facing messages.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The named document, tarball, or package root does not exist.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Exclusive create failed because the document already exists.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The document bytes are not valid JSON for the requested type.
    #[error("invalid JSON in {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Lock acquisition failed because the resource is already locked.
    ///
    /// Kept distinct from `Io` so callers can choose to wait and retry.
    #[error("resource is locked: {0}")]
    Locked(String),

    /// Lock release failed because no lock is held for the resource.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// The entry name would escape the storage root or collide with a
    /// reserved namespace.
    #[error("invalid entry name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// A tarball transfer was aborted before completion; no final artifact
    /// was produced.
    #[error("transfer aborted before completion")]
    Aborted,

    /// Filesystem-level fault: permissions, disk, or path gone.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// `true` if the target was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// `true` if the error is a conflict a caller may retry after backoff.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::AlreadyExists(_) | StorageError::Locked(_)
        )
    }
}

impl From<LockError> for StorageError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Locked { resource } => StorageError::Locked(resource),
            LockError::NotHeld { resource } => StorageError::NotHeld(resource),
            LockError::InvalidResource { name, reason } => {
                StorageError::InvalidName { name, reason }
            }
            LockError::Io(e) => StorageError::Io(e),
        }
    }
}

/// Convenience alias used throughout the storage crate.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let not_found = StorageError::NotFound("manifest".into());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let exists = StorageError::AlreadyExists("manifest".into());
        assert!(exists.is_conflict());

        let locked = StorageError::Locked("manifest".into());
        assert!(locked.is_conflict());
        assert!(!locked.is_not_found());
    }

    #[test]
    fn lock_conflict_never_degrades_to_io() {
        let err: StorageError = LockError::Locked {
            resource: "manifest".into(),
        }
        .into();
        assert!(matches!(err, StorageError::Locked(_)));

        let err: StorageError = LockError::NotHeld {
            resource: "manifest".into(),
        }
        .into();
        assert!(matches!(err, StorageError::NotHeld(_)));
    }
}
