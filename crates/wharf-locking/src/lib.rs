//! Advisory file-marker locks for wharf storage roots.
//!
//! A lock is a marker file (`<resource>.lock`) created with exclusive-create
//! semantics inside a lock directory. Because creation is a single atomic
//! filesystem operation, mutual exclusion holds across threads *and* across
//! independent processes sharing the same directory — which is why this is a
//! marker file and not an in-process mutex. Resources may be nested relative
//! paths (`scope/manifest`); the marker is created beside the nested path.
//!
//! Locks are advisory: nothing stops a caller from ignoring them, and there
//! is no owner tracking beyond the marker's existence. A process that dies
//! while holding a lock leaves a stale marker that must be cleared manually;
//! there is no TTL or auto-expiry.

pub mod error;
pub mod lock;

pub use error::{LockError, Result};
pub use lock::{LockDir, LockHandle, LockOptions, LOCK_SUFFIX};
