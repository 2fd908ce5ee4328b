//! The storage root: one directory scoping one package's documents and
//! tarballs.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, Span};
use wharf_locking::{LockDir, LockHandle, LockOptions};

use crate::error::{Result, StorageError};
use crate::names::validate_entry_name;
use crate::tarball::{staging_path, TarballReader, TarballWriter};

/// Tuning knobs for tarball streams.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Size of each `Data` chunk read from a tarball.
    pub chunk_size: usize,
    /// Capacity of the stream event channel; the bound is the backpressure.
    pub channel_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            channel_capacity: 16,
        }
    }
}

/// Filesystem storage for a single package.
///
/// Every operation resolves strictly beneath the bound root directory.
/// The root holds no state beyond its path, lock scope, and diagnostics
/// span; it is cheap to construct per logical package.
///
/// Concurrency: JSON document mutual exclusion across callers *and*
/// processes is the advisory lock marker (see
/// [`lock_and_read_json`](Self::lock_and_read_json)); blind writes have no
/// extra serialization
/// beyond each write being an atomic rename, so the last writer wins.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
    locks: LockDir,
    config: StorageConfig,
    span: Span,
}

impl LocalStorage {
    /// Bind a storage root to `path` with default stream tuning.
    ///
    /// The directory is created lazily by the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, StorageConfig::default())
    }

    /// Bind a storage root with explicit stream tuning.
    pub fn with_config(path: impl Into<PathBuf>, config: StorageConfig) -> Self {
        let root = path.into();
        // Diagnostics capability for everything scoped to this root; no
        // global logger state.
        let span = tracing::debug_span!("storage", root = %root.display());
        let locks = LockDir::new(&root);
        Self {
            root,
            locks,
            config,
            span,
        }
    }

    /// The directory this storage is bound to.
    pub fn path(&self) -> &Path {
        &self.root
    }

    // ------------------------------------------------------------------
    // JSON documents
    // ------------------------------------------------------------------

    /// Read and parse the JSON document `name`.
    pub async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.entry_path(name)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Parse {
            name: name.to_string(),
            source,
        })
    }

    /// Serialize `value` and overwrite the document `name` unconditionally.
    ///
    /// This is the blind-write path for already-validated updates: no
    /// existence check, no locking. The content is staged and promoted with
    /// an atomic rename, so a concurrent reader sees either the previous or
    /// the new document, never a partial write.
    pub async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.entry_path(name)?;
        let data = to_json_vec(name, value)?;

        // Nested names get their intermediate directories on demand; the
        // staging file lands beside the destination so the promotion is a
        // same-directory rename.
        let parent = entry_parent(&self.root, &path);
        fs::create_dir_all(parent).await?;
        let staging = staging_path(parent);
        if let Err(e) = fs::write(&staging, &data).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        debug!(parent: &self.span, name, bytes = data.len(), "document written");
        Ok(())
    }

    /// Like [`write_json`](Self::write_json) but fails with `AlreadyExists`
    /// if the document is present.
    ///
    /// The existence check and the write are a single exclusive-create
    /// (`O_EXCL`) operation, so two concurrent creators cannot both succeed
    /// and an existing document is never touched.
    pub async fn create_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.entry_path(name)?;
        let data = to_json_vec(name, value)?;

        fs::create_dir_all(entry_parent(&self.root, &path)).await?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let write_result = async {
            file.write_all(&data).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = write_result {
            // The exclusive create succeeded but the body didn't land;
            // don't leave a truncated document under the final name.
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(e.into());
        }
        debug!(parent: &self.span, name, bytes = data.len(), "document created");
        Ok(())
    }

    /// Remove the document `name`.
    pub async fn delete_json(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(parent: &self.span, name, "document deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the advisory lock for `name`, then read the document.
    ///
    /// On success the caller owns the returned [`LockHandle`] and must call
    /// [`unlock_json`](Self::unlock_json) once its read-modify-write
    /// sequence completes. On any read failure the lock is released before
    /// the error is surfaced, so a failed read never leaks a lock.
    pub async fn lock_and_read_json<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<(T, LockHandle)> {
        self.lock_and_read_json_with(name, &LockOptions::default())
            .await
    }

    /// [`lock_and_read_json`](Self::lock_and_read_json) with a bounded lock
    /// retry policy.
    pub async fn lock_and_read_json_with<T: DeserializeOwned>(
        &self,
        name: &str,
        opts: &LockOptions,
    ) -> Result<(T, LockHandle)> {
        let handle = self.locks.acquire_with(name, opts).await?;
        match self.read_json(name).await {
            Ok(value) => Ok((value, handle)),
            Err(read_err) => {
                if let Err(release_err) = self.locks.release(handle).await {
                    debug!(
                        parent: &self.span,
                        name,
                        error = %release_err,
                        "lock release failed on read-error path"
                    );
                }
                Err(read_err)
            }
        }
    }

    /// Release the lock previously obtained for `name`.
    pub async fn unlock_json(&self, name: &str) -> Result<()> {
        self.locks.release_named(name).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tarballs
    // ------------------------------------------------------------------

    /// Open a read stream over the tarball `name`.
    ///
    /// Stream construction never fails directly; a missing or unreadable
    /// tarball (or an invalid name) surfaces as a single `Error` event with
    /// no data.
    pub fn read_tarball(&self, name: &str) -> TarballReader {
        match self.entry_path(name) {
            Ok(path) => TarballReader::spawn(
                name.to_string(),
                path,
                self.config.chunk_size,
                self.config.channel_capacity,
                self.span.clone(),
            ),
            Err(e) => TarballReader::failed(e),
        }
    }

    /// Open a write stream staging a new tarball for `name`.
    ///
    /// Bytes land in a staging file; the tarball only appears under `name`
    /// after [`TarballWriter::done`].
    pub async fn write_tarball(&self, name: &str) -> Result<TarballWriter> {
        let dest = self.entry_path(name)?;
        let writer = TarballWriter::open(dest).await?;
        debug!(parent: &self.span, name, "tarball write stream opened");
        Ok(writer)
    }

    // ------------------------------------------------------------------
    // Root lifecycle
    // ------------------------------------------------------------------

    /// Delete the entire storage root recursively.
    ///
    /// Fails with `NotFound` if the directory does not exist at call time.
    /// Not transactional: a failure mid-deletion surfaces as `Io` with the
    /// remainder left on disk for the caller to retry or inspect.
    pub async fn remove_package(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(parent: &self.span, "package root removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.root.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        validate_entry_name(name)?;
        Ok(self.root.join(name))
    }
}

/// Directory a validated entry path lives in; the root itself for
/// single-component names.
fn entry_parent<'a>(root: &'a Path, path: &'a Path) -> &'a Path {
    path.parent().unwrap_or(root)
}

fn to_json_vec<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| StorageError::Parse {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarball::{pipe, TarballEvent};
    use serde_json::{json, Value};

    fn storage_in(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().join("pkg"))
    }

    #[tokio::test]
    async fn create_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let value = json!({"name": "pkg4", "versions": {"1.0.0": {}}});

        storage.create_json("package4", &value).await.unwrap();
        let read: Value = storage.read_json("package4").await.unwrap();
        assert_eq!(read, value);
    }

    #[tokio::test]
    async fn create_existing_fails_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        storage
            .create_json("package4", &json!({"name": "pkg4"}))
            .await
            .unwrap();
        let err = storage
            .create_json("package4", &json!({"name": "other"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let read: Value = storage.read_json("package4").await.unwrap();
        assert_eq!(read, json!({"name": "pkg4"}));
    }

    #[tokio::test]
    async fn read_missing_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let err = storage.read_json::<Value>("absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn read_corrupt_fails_parse() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        std::fs::create_dir_all(storage.path()).unwrap();
        std::fs::write(storage.path().join("corrupt"), b"{not json").unwrap();

        let err = storage.read_json::<Value>("corrupt").await.unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }

    #[tokio::test]
    async fn write_json_overwrites_blindly() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        storage.write_json("manifest", &json!({"rev": 1})).await.unwrap();
        storage.write_json("manifest", &json!({"rev": 2})).await.unwrap();

        let read: Value = storage.read_json("manifest").await.unwrap();
        assert_eq!(read, json!({"rev": 2}));
    }

    #[tokio::test]
    async fn delete_json_removes_document() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        storage.write_json("manifest", &json!({})).await.unwrap();
        storage.delete_json("manifest").await.unwrap();

        let err = storage.delete_json("manifest").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn invalid_names_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let err = storage.read_json::<Value>("../escape").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName { .. }));

        let err = storage.write_json("a/../b", &json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName { .. }));

        let err = storage.write_tarball("pkg.lock").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn nested_document_names_supported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        storage
            .write_json("_storage/package4", &json!({"data": 5}))
            .await
            .unwrap();
        let read: Value = storage.read_json("_storage/package4").await.unwrap();
        assert_eq!(read, json!({"data": 5}));

        // Exclusive create and the advisory lock work on nested names too.
        let err = storage
            .create_json("_storage/package4", &json!({"data": 6}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let (value, _handle): (Value, _) = storage
            .lock_and_read_json("_storage/package4")
            .await
            .unwrap();
        assert_eq!(value, json!({"data": 5}));
        storage.unlock_json("_storage/package4").await.unwrap();

        storage.delete_json("_storage/package4").await.unwrap();
        let err = storage
            .read_json::<Value>("_storage/package4")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn nested_tarball_names_supported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let name = "_createWriteStream/new-readme-0.0.0.tgz";

        let mut writer = storage.write_tarball(name).await.unwrap();
        writer.write(b"nested tarball bytes").await.unwrap();
        writer.done().await.unwrap();

        let mut reader = storage.read_tarball(name);
        match reader.next_event().await {
            Some(TarballEvent::ContentLength(len)) => assert_eq!(len, 20),
            other => panic!("expected content length first, got {other:?}"),
        }
        assert_eq!(
            std::fs::read(storage.path().join(name)).unwrap(),
            b"nested tarball bytes"
        );
    }

    #[tokio::test]
    async fn lock_and_read_returns_value_and_handle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        storage
            .write_json("manifest", &json!({"rev": 1}))
            .await
            .unwrap();

        let (value, handle): (Value, _) =
            storage.lock_and_read_json("manifest").await.unwrap();
        assert_eq!(value, json!({"rev": 1}));
        assert_eq!(handle.resource(), "manifest");

        // Held: a second locked read conflicts.
        let err = storage
            .lock_and_read_json::<Value>("manifest")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Locked(_)));

        // Typical read-modify-write: write back, then unlock.
        storage
            .write_json("manifest", &json!({"rev": 2}))
            .await
            .unwrap();
        storage.unlock_json("manifest").await.unwrap();

        // Released: locking again succeeds.
        let (value, _handle): (Value, _) =
            storage.lock_and_read_json("manifest").await.unwrap();
        assert_eq!(value, json!({"rev": 2}));
    }

    #[tokio::test]
    async fn failed_locked_read_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let err = storage
            .lock_and_read_json::<Value>("absent")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // The failure path must not leak the lock: creating the document
        // and locking it now succeeds.
        storage.create_json("absent", &json!({})).await.unwrap();
        storage.lock_and_read_json::<Value>("absent").await.unwrap();
    }

    #[tokio::test]
    async fn unlock_without_lock_fails_not_held() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let err = storage.unlock_json("manifest").await.unwrap_err();
        assert!(matches!(err, StorageError::NotHeld(_)));
    }

    #[tokio::test]
    async fn remove_package_deletes_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.write_json("manifest", &json!({})).await.unwrap();
        storage
            .write_tarball("pkg.tgz")
            .await
            .unwrap()
            .done()
            .await
            .unwrap();

        storage.remove_package().await.unwrap();
        assert!(!storage.path().exists());
    }

    #[tokio::test]
    async fn remove_missing_package_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let err = storage.remove_package().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn tarball_roundtrip_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let source = storage_in(&dir);
        let dest = LocalStorage::new(dir.path().join("other-pkg"));
        let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = source.write_tarball("pkg-1.0.0.tgz").await.unwrap();
        writer.write(&contents).await.unwrap();
        writer.done().await.unwrap();

        let reader = source.read_tarball("pkg-1.0.0.tgz");
        let writer = dest.write_tarball("pkg-1.0.0.tgz").await.unwrap();
        let bytes = pipe(reader, writer).await.unwrap();

        assert_eq!(bytes, contents.len() as u64);
        assert_eq!(
            std::fs::read(dest.path().join("pkg-1.0.0.tgz")).unwrap(),
            contents
        );
    }

    #[tokio::test]
    async fn read_tarball_reports_exact_length_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let mut writer = storage.write_tarball("pkg.tgz").await.unwrap();
        writer.write(&[1u8; 352]).await.unwrap();
        writer.done().await.unwrap();

        let mut reader = storage.read_tarball("pkg.tgz");
        match reader.next_event().await {
            Some(TarballEvent::ContentLength(len)) => assert_eq!(len, 352),
            other => panic!("expected content length first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_tarball_invalid_name_errors_via_stream() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let mut reader = storage.read_tarball("../escape.tgz");
        match reader.next_event().await {
            Some(TarballEvent::Error(StorageError::InvalidName { .. })) => {}
            other => panic!("expected invalid-name error event, got {other:?}"),
        }
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    async fn aborted_tarball_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);

        let mut writer = storage.write_tarball("pkg.tgz").await.unwrap();
        writer.write(b"partial").await.unwrap();
        let err = writer.abort().await;
        assert!(matches!(err, StorageError::Aborted));

        let mut reader = storage.read_tarball("pkg.tgz");
        match reader.next_event().await {
            Some(TarballEvent::Error(e)) => assert!(e.is_not_found()),
            other => panic!("expected not-found error, got {other:?}"),
        }
    }
}
