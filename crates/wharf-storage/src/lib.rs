//! Local filesystem storage backend for the wharf package registry.
//!
//! A [`LocalStorage`] scopes one package's data to a single directory: JSON
//! metadata documents and opaque tarball blobs, one file per entry. The crate
//! provides the locking and streaming layer that makes metadata updates safe
//! under concurrent access (including across processes sharing the root) and
//! makes tarball transfer abortable with backpressure.
//!
//! # Layout
//!
//! ```text
//! <root>/<name>            JSON document or tarball
//! <root>/<name>.lock       advisory lock marker (reserved namespace)
//! <root>/<dir>/.tmp-<uuid> write-in-progress staging file, beside its
//!                          destination (reserved namespace)
//! ```
//!
//! Entry names may be nested relative paths (`_storage/package4`);
//! intermediate directories are created on write. Every path component is
//! validated so a name can never collide with the reserved namespaces or
//! escape the root.
//!
//! # Design Rules
//!
//! 1. A document read never observes a partial write: creates are
//!    exclusive-create, overwrites are stage-then-rename.
//! 2. Cross-process mutual exclusion is the lock marker file, never an
//!    in-process mutex.
//! 3. A tarball is only visible under its final name after `done()`;
//!    aborted or failed transfers clean up their staging file.
//! 4. Stream events are ordered: `ContentLength` before the first `Data`,
//!    exactly one terminal `End` or `Error`.
//! 5. Failures propagate to the caller as typed errors; the crate never
//!    retries internally.

pub mod error;
pub mod local;
pub mod names;
pub mod tarball;

pub use error::{Result, StorageError};
pub use local::{LocalStorage, StorageConfig};
pub use names::validate_entry_name;
pub use tarball::{pipe, TarballEvent, TarballReader, TarballWriter};

// Lock types surface in this crate's public API (`lock_and_read_json`).
pub use wharf_locking::{LockDir, LockError, LockHandle, LockOptions};
