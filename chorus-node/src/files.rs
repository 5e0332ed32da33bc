//! On-disk collaborators: serve files from a directory, write fetched segments to a file.
//!
//! Everything here touches the disk synchronously. The node calls [`DiskSource`] from
//! `spawn_blocking`, and [`FileSink`] hands its writes to a blocking task of its own.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use chorus_core::SegmentSink;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Serves files found under `root`. Names are relative paths; anything escaping `root` is refused.
#[derive(Debug, Clone)]
pub struct DiskSource {
    root: PathBuf,
}

impl DiskSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let rel = Path::new(name);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || !safe {
            return None;
        }
        Some(self.root.join(rel))
    }

    /// Size in bytes of the named regular file, or `None` if it cannot be served.
    pub fn open(&self, name: &str) -> Option<u64> {
        let path = self.resolve(name)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot open shared file");
                None
            }
        }
    }

    /// Read `range` of the named file.
    pub fn read(&self, name: &str, range: Range<u64>) -> io::Result<Vec<u8>> {
        let path = self
            .resolve(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let len = usize::try_from(range.end.saturating_sub(range.start))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug)]
enum SinkOp {
    Write { offset: u64, bytes: Vec<u8> },
    Finish,
}

/// Writes segments at their byte offsets from a blocking task. Errors are logged; the
/// transfer carries on.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    ops: mpsc::UnboundedSender<SinkOp>,
    writer: Option<JoinHandle<()>>,
    finished: bool,
}

impl FileSink {
    /// Create (or truncate) `path`, creating parent directories as needed. Blocking.
    pub fn create_file(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
    }

    /// Start the writer task for `file`. Must be called within a tokio runtime.
    pub fn spawn(file: File, path: PathBuf) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let task_path = path.clone();
        let writer = tokio::task::spawn_blocking(move || write_loop(file, &task_path, rx));
        Self {
            path,
            ops,
            writer: Some(writer),
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish, then wait until every queued write has reached the file.
    pub async fn close(mut self) {
        self.finish();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                tracing::error!(path = %self.path.display(), error = %e, "writer task failed");
            }
        }
    }

    fn submit(&self, op: SinkOp) {
        if self.ops.send(op).is_err() {
            tracing::debug!(path = %self.path.display(), "writer already stopped, dropping write");
        }
    }
}

impl SegmentSink for FileSink {
    fn write_segment(&mut self, range: Range<u64>, bytes: &[u8], is_final: bool) {
        self.submit(SinkOp::Write {
            offset: range.start,
            bytes: bytes.to_vec(),
        });
        if is_final {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.submit(SinkOp::Finish);
        }
    }
}

/// Apply writes in order until `Finish` (sync and stop) or until the sink is dropped.
fn write_loop(mut file: File, path: &Path, mut ops: mpsc::UnboundedReceiver<SinkOp>) {
    while let Some(op) = ops.blocking_recv() {
        match op {
            SinkOp::Write { offset, bytes } => {
                if let Err(e) = write_at(&mut file, offset, &bytes) {
                    tracing::error!(path = %path.display(), offset, error = %e, "segment write failed");
                }
            }
            SinkOp::Finish => {
                if let Err(e) = file.sync_all() {
                    tracing::warn!(path = %path.display(), error = %e, "sync failed");
                }
                tracing::debug!(path = %path.display(), "download file closed");
                return;
            }
        }
    }
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

/// Local file name for a fetched `name`: its last path component.
pub fn download_name(name: &str) -> Option<&str> {
    Path::new(name).file_name().and_then(|n| n.to_str())
}
