//! Tarball stream transport: chunked reads with upfront length, staged
//! writes with explicit success/abort finalization.
//!
//! A read stream is a spawned producer task feeding a bounded channel of
//! tagged [`TarballEvent`]s; the bounded capacity is the backpressure. Event
//! ordering per stream: exactly one `ContentLength` before any `Data`, data
//! chunks in file byte order, then exactly one terminal `End` — or exactly
//! one `Error` in its place. A stream that fails to open emits only `Error`.
//!
//! A write stream buffers chunks to a `.tmp-<uuid>` staging file next to the
//! destination, so a partially-written tarball is never visible under the
//! final name. `done()` promotes the staging file with an atomic rename;
//! `abort()` unlinks it without ever touching the destination. Both consume
//! the writer, so the terminal actions are single-use and mutually exclusive
//! by construction.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, Instrument, Span};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Prefix of write-staging file names within a storage root.
pub const STAGING_PREFIX: &str = ".tmp-";

/// Fresh staging path inside `dir`, unique per transfer.
pub(crate) fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{STAGING_PREFIX}{}", Uuid::now_v7().simple()))
}

/// A tagged notification from a tarball read stream.
#[derive(Debug)]
pub enum TarballEvent {
    /// Exact byte size of the tarball, taken from file metadata at open
    /// time. Always delivered before the first `Data` chunk.
    ContentLength(u64),
    /// The next chunk of file bytes, in file order.
    Data(Bytes),
    /// Terminal: all data delivered. Mutually exclusive with `Error`.
    End,
    /// Terminal: the stream failed. No further events follow.
    Error(StorageError),
}

/// Readable byte stream over an existing tarball.
///
/// Lazy, finite, and non-restartable. Dropping the reader closes the
/// channel; the producer notices on its next send and stops reading.
#[derive(Debug)]
pub struct TarballReader {
    rx: mpsc::Receiver<TarballEvent>,
    content_length: Option<u64>,
}

impl TarballReader {
    pub(crate) fn spawn(
        name: String,
        path: PathBuf,
        chunk_size: usize,
        capacity: usize,
        span: Span,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(produce(name, path, chunk_size, tx).instrument(span));
        Self {
            rx,
            content_length: None,
        }
    }

    /// A stream that was dead on arrival: emits the given error and nothing
    /// else.
    pub(crate) fn failed(err: StorageError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(TarballEvent::Error(err));
        Self {
            rx,
            content_length: None,
        }
    }

    /// Pull the next event. Returns `None` once a terminal event has been
    /// consumed and the channel is drained.
    pub async fn next_event(&mut self) -> Option<TarballEvent> {
        let event = self.rx.recv().await;
        if let Some(TarballEvent::ContentLength(len)) = &event {
            self.content_length = Some(*len);
        }
        event
    }

    /// The announced content length, once the `ContentLength` event has been
    /// observed via [`next_event`](Self::next_event).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

/// Producer task: open, announce length, stream chunks, terminate once.
async fn produce(name: String, path: PathBuf, chunk_size: usize, tx: mpsc::Sender<TarballEvent>) {
    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            let err = if e.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(name)
            } else {
                e.into()
            };
            let _ = tx.send(TarballEvent::Error(err)).await;
            return;
        }
    };

    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            let _ = tx.send(TarballEvent::Error(e.into())).await;
            return;
        }
    };
    debug!(name = %name, len, "tarball read stream opened");

    if tx.send(TarballEvent::ContentLength(len)).await.is_err() {
        // Receiver dropped before the first event: abandoned stream.
        return;
    }

    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(TarballEvent::End).await;
                debug!(name = %name, "tarball read stream complete");
                return;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(TarballEvent::Data(chunk)).await.is_err() {
                    // Receiver dropped mid-stream: stop reading, no terminal
                    // event can be observed anyway.
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(TarballEvent::Error(e.into())).await;
                return;
            }
        }
    }
}

/// Writable byte sink that stages a new tarball and promotes it on
/// [`done`](Self::done).
///
/// If an underlying write fails, the staging file is removed before the
/// error is surfaced and the writer is poisoned: every later call fails
/// with the error that killed the stream.
/// Dropping a writer without calling `done` or `abort` removes the staging
/// file best-effort and never touches the destination.
#[derive(Debug)]
pub struct TarballWriter {
    file: Option<File>,
    staging: PathBuf,
    dest: PathBuf,
    bytes_written: u64,
    failure: Option<io::ErrorKind>,
    finalized: bool,
}

impl TarballWriter {
    pub(crate) async fn open(dest: PathBuf) -> Result<Self> {
        // Stage in the destination's directory so promotion is a
        // same-directory atomic rename. Intermediate directories are created
        // here for nested destinations.
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;
        let staging = staging_path(&parent);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;
        Ok(Self {
            file: Some(file),
            staging,
            dest,
            bytes_written: 0,
            failure: None,
            finalized: false,
        })
    }

    /// Append a chunk to the staging file.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(self.terminal_error());
        }
        let file = self.file.as_mut().expect("staging file open until finalization");
        if let Err(e) = file.write_all(chunk).await {
            return Err(self.poison(e).await);
        }
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Success finalization: flush, sync, and atomically rename the staging
    /// file onto the destination, overwriting any prior content there.
    ///
    /// Returns the number of bytes promoted. Any failing step removes the
    /// staging file and surfaces the error instead.
    pub async fn done(mut self) -> Result<u64> {
        if self.finalized {
            return Err(self.terminal_error());
        }
        let mut file = self.file.take().expect("staging file open until finalization");

        if let Err(e) = file.flush().await {
            drop(file);
            self.discard().await.ok();
            return Err(e.into());
        }
        if let Err(e) = file.sync_all().await {
            drop(file);
            self.discard().await.ok();
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&self.staging, &self.dest).await {
            self.discard().await.ok();
            return Err(e.into());
        }
        self.finalized = true;
        debug!(
            dest = %self.dest.display(),
            bytes = self.bytes_written,
            "tarball promoted"
        );
        Ok(self.bytes_written)
    }

    /// Abnormal termination: discard buffered data and delete the staging
    /// file without ever touching the destination.
    ///
    /// The abort is signalled, not silent: after cleanup this returns
    /// [`StorageError::Aborted`] so a driving loop observes a failed
    /// transfer. If cleanup itself fails, that I/O error is returned
    /// instead.
    pub async fn abort(mut self) -> StorageError {
        debug!(dest = %self.dest.display(), "tarball write aborted");
        match self.discard().await {
            Ok(()) => StorageError::Aborted,
            Err(e) => e,
        }
    }

    /// Record a write failure, discard the staging file, and hand back the
    /// error for surfacing. Later calls replay the same failure.
    async fn poison(&mut self, e: io::Error) -> StorageError {
        self.failure = Some(e.kind());
        self.discard().await.ok();
        e.into()
    }

    /// The error a finalized-by-failure writer keeps returning.
    fn terminal_error(&self) -> StorageError {
        match self.failure {
            Some(kind) => StorageError::Io(kind.into()),
            None => StorageError::Aborted,
        }
    }

    /// Close and remove the staging file; finalizes the writer.
    async fn discard(&mut self) -> Result<()> {
        self.file = None;
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        match fs::remove_file(&self.staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TarballWriter {
    fn drop(&mut self) {
        if !self.finalized {
            // Neither done() nor abort() ran. Close the handle and remove
            // the staging file best-effort; the destination is untouched.
            self.file = None;
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

/// Drive a read stream into a write stream.
///
/// Calls `done()` when the source signals `End` and aborts the writer if the
/// source errors, so the destination only ever appears as a byte-identical
/// copy. Returns the number of bytes transferred.
pub async fn pipe(mut reader: TarballReader, mut writer: TarballWriter) -> Result<u64> {
    while let Some(event) = reader.next_event().await {
        match event {
            TarballEvent::ContentLength(_) => {}
            TarballEvent::Data(chunk) => writer.write(&chunk).await?,
            TarballEvent::End => return writer.done().await,
            TarballEvent::Error(e) => {
                writer.abort().await;
                return Err(e);
            }
        }
    }
    // The producer vanished without a terminal event; treat the transfer as
    // aborted.
    Err(writer.abort().await)
}
