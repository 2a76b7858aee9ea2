// housekeeper/src/backup/sink.rs
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::s3_upload::ObjectStore;
use crate::errors::HousekeeperError;

/// Bytes handed to the upload task per message.
const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks in flight before writers block.
const PIPE_CAPACITY: usize = 16;

/// Where finished archive bytes go.
#[derive(Clone)]
pub enum Sink {
    /// File inside the storage directory.
    Local(PathBuf),
    /// Object in a remote store, streamed while the archive is written.
    Remote(Arc<dyn ObjectStore>),
}

impl Sink {
    /// Opens `name` for writing. Remote sinks must be opened from a thread that
    /// belongs to a tokio runtime but is allowed to block (e.g. `spawn_blocking`).
    pub fn open(&self, name: &str) -> Result<SinkWriter> {
        match self {
            Sink::Local(storage) => {
                let path = storage.join(name);
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create backup file {}", path.display()))?;
                debug!(path = %path.display(), "Opened local archive");
                Ok(SinkWriter::Local {
                    file: BufWriter::new(file),
                    path,
                })
            }
            Sink::Remote(store) => {
                let handle = Handle::try_current()
                    .context("Remote upload needs a running tokio runtime")?;
                let (tx, rx) = mpsc::channel::<Bytes>(PIPE_CAPACITY);
                let store = Arc::clone(store);
                let object = name.to_string();
                let upload = handle.spawn(async move { store.put_stream(&object, rx).await });
                debug!(object = %name, "Started remote upload");
                Ok(SinkWriter::Remote(RemoteWriter {
                    name: name.to_string(),
                    tx: Some(tx),
                    buffer: BytesMut::with_capacity(CHUNK_SIZE),
                    upload: Some(upload),
                    handle,
                }))
            }
        }
    }
}

pub enum SinkWriter {
    Local { file: BufWriter<File>, path: PathBuf },
    Remote(RemoteWriter),
}

impl SinkWriter {
    /// Makes the written bytes durable. For remote sinks this waits until the
    /// upload task has finished and returns its outcome.
    pub fn close(self) -> Result<()> {
        match self {
            SinkWriter::Local { file, path } => {
                let file = file
                    .into_inner()
                    .map_err(|e| e.into_error())
                    .with_context(|| format!("Failed to flush backup file {}", path.display()))?;
                file.sync_all()
                    .with_context(|| format!("Failed to sync backup file {}", path.display()))?;
                Ok(())
            }
            SinkWriter::Remote(remote) => remote.close(),
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Local { file, .. } => file.write(buf),
            SinkWriter::Remote(remote) => remote.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Local { file, .. } => file.flush(),
            SinkWriter::Remote(remote) => remote.flush(),
        }
    }
}

/// Writing half of the in-process pipe feeding an upload task.
pub struct RemoteWriter {
    name: String,
    tx: Option<mpsc::Sender<Bytes>>,
    buffer: BytesMut,
    upload: Option<JoinHandle<Result<()>>>,
    handle: Handle,
}

impl RemoteWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "remote upload already closed"))?;
        tx.blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote upload stopped"))
    }

    fn close(mut self) -> Result<()> {
        let flushed = self.send_buffered();
        // dropping the sender ends the object
        self.tx.take();

        let upload = self
            .upload
            .take()
            .context("Remote upload was already closed")?;
        let outcome = self.handle.block_on(upload).map_err(|e| {
            HousekeeperError::Upload(format!("upload task for {} did not complete: {}", self.name, e))
        })?;

        // the upload's own error explains a broken pipe better than the pipe does
        outcome.with_context(|| format!("Failed to upload {}", self.name))?;
        flushed.with_context(|| format!("Failed to hand last bytes of {} to upload", self.name))?;
        Ok(())
    }
}

impl Write for RemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        // never let a writer that was not closed complete a truncated object
        if let Some(upload) = self.upload.take() {
            warn!(object = %self.name, "Remote writer dropped without close, cancelling upload");
            upload.abort();
        }
    }
}
