use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tracing::debug;

use crate::error::{LockError, Result};

/// Suffix appended to a resource name to form its marker file name.
pub const LOCK_SUFFIX: &str = ".lock";

/// Bounded retry policy for [`LockDir::acquire_with`].
///
/// The default performs a single attempt (no retries): acquisition either
/// succeeds immediately or fails with [`LockError::Locked`].
#[derive(Clone, Debug)]
pub struct LockOptions {
    /// Number of additional attempts after the first one fails.
    pub retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// A held advisory lock on a named resource.
///
/// The handle is a claim token, not an RAII guard: dropping it does **not**
/// release the lock. Callers pair [`LockDir::acquire`] with
/// [`LockDir::release`] explicitly.
#[derive(Debug)]
pub struct LockHandle {
    resource: String,
    marker: PathBuf,
}

impl LockHandle {
    /// The resource name this handle claims.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Path of the marker file backing this claim.
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }
}

/// Scopes advisory locks to a single directory.
///
/// At most one live marker per resource name can exist under the directory
/// at a time; the marker is created with exclusive-create (`O_EXCL`)
/// semantics, so the existence check and the claim are one atomic operation.
///
/// # Stale locks
///
/// A process that crashes while holding a lock leaves its marker behind.
/// There is no auto-expiry; stale markers must be removed out-of-band
/// (e.g. by an operator deleting the `.lock` file).
#[derive(Clone, Debug)]
pub struct LockDir {
    root: PathBuf,
}

impl LockDir {
    /// Create a lock directory scope. The directory itself is created lazily
    /// on first acquisition.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory this scope is bound to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire the lock for `resource`, failing fast if it is already held.
    pub async fn acquire(&self, resource: &str) -> Result<LockHandle> {
        validate_resource(resource)?;
        self.try_create_marker(resource).await
    }

    /// Acquire the lock for `resource` with a bounded retry policy.
    ///
    /// Sleeps `opts.retry_delay` between attempts and surfaces
    /// [`LockError::Locked`] once `opts.retries` additional attempts have
    /// been exhausted. Never blocks unboundedly.
    pub async fn acquire_with(&self, resource: &str, opts: &LockOptions) -> Result<LockHandle> {
        validate_resource(resource)?;
        let mut attempts_left = opts.retries;
        loop {
            match self.try_create_marker(resource).await {
                Err(LockError::Locked { .. }) if attempts_left > 0 => {
                    attempts_left -= 1;
                    tokio::time::sleep(opts.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    /// Release a previously acquired lock.
    ///
    /// Fails with [`LockError::NotHeld`] if the marker no longer exists —
    /// releasing an unheld lock is an error, not a silent success.
    pub async fn release(&self, handle: LockHandle) -> Result<()> {
        self.release_named(&handle.resource).await
    }

    /// Release the lock for `resource` by name, without a handle.
    ///
    /// This exists because the lock is advisory and owner-less: any caller
    /// trusted with the directory may clear a marker it knows it holds.
    pub async fn release_named(&self, resource: &str) -> Result<()> {
        validate_resource(resource)?;
        let marker = self.marker_path(resource);
        match fs::remove_file(&marker).await {
            Ok(()) => {
                debug!(resource, marker = %marker.display(), "lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LockError::NotHeld {
                resource: resource.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a marker currently exists for `resource`.
    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        validate_resource(resource)?;
        match fs::metadata(self.marker_path(resource)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn marker_path(&self, resource: &str) -> PathBuf {
        self.root.join(format!("{resource}{LOCK_SUFFIX}"))
    }

    async fn try_create_marker(&self, resource: &str) -> Result<LockHandle> {
        let marker = self.marker_path(resource);
        // Nested resources put the marker beside the nested file.
        match marker.parent() {
            Some(parent) => fs::create_dir_all(parent).await?,
            None => fs::create_dir_all(&self.root).await?,
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(_file) => {
                debug!(resource, marker = %marker.display(), "lock acquired");
                Ok(LockHandle {
                    resource: resource.to_string(),
                    marker,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Locked {
                resource: resource.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate that a resource name resolves to a marker strictly inside the
/// lock directory and cannot collide with another resource's marker.
///
/// Resources may be nested (`scope/manifest`); the marker lands beside the
/// nested path (`scope/manifest.lock`). Each `/`-separated component must be
/// a plain file name.
fn validate_resource(name: &str) -> Result<()> {
    let err = |reason: &str| {
        Err(LockError::InvalidResource {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return err("resource name must not be empty");
    }
    if name.contains('\\') {
        return err("must not contain backslashes");
    }
    if name.contains('\0') {
        return err("must not contain NUL");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return err("must not start or end with '/'");
    }
    for component in name.split('/') {
        if component.is_empty() {
            return err("must not contain consecutive slashes");
        }
        if component == "." || component == ".." {
            return err("must not contain relative path components");
        }
        if component.ends_with(LOCK_SUFFIX) {
            return err("components must not end with the lock marker suffix");
        }
    }
    Ok(())
}
