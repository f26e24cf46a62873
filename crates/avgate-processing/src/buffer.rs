//! Hybrid memory/disk spool buffer for streamed uploads.
//!
//! A `SpoolBuffer` starts in memory and spills to a temp file once the
//! configured threshold is crossed, so small uploads never touch disk while
//! large ones never blow up the resident set. The transition happens at
//! most once and never reverses.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Chunk size handed out by [`BufferReader`].
const READER_CHUNK_SIZE: usize = 128 * 1024;

/// Hybrid-mode spool is synced to disk after this many unsynced bytes.
const SYNC_INTERVAL: u64 = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    Memory,
    Hybrid,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferStats {
    pub mode: BufferMode,
    pub total_size: u64,
    pub memory_size: u64,
    pub disk_size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("file of {attempted} bytes exceeds the {max} byte cap")]
    FileTooLarge { attempted: u64, max: u64 },

    #[error("spool IO failed: {0}")]
    Io(#[from] std::io::Error),
}

struct Spool {
    path: PathBuf,
    file: File,
    unsynced: u64,
}

/// Append-only store for one upload's file part.
pub struct SpoolBuffer {
    mode: BufferMode,
    chunks: Vec<Bytes>,
    total_size: u64,
    memory_threshold: u64,
    max_file_size: u64,
    tmp_dir: PathBuf,
    spool: Option<Spool>,
}

impl SpoolBuffer {
    pub fn new(memory_threshold: u64, max_file_size: u64, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: BufferMode::Memory,
            chunks: Vec::new(),
            total_size: 0,
            memory_threshold,
            max_file_size,
            tmp_dir: tmp_dir.into(),
            spool: None,
        }
    }

    /// Appends `data` atomically: on error the buffer is unchanged.
    ///
    /// Crossing the memory threshold spills every buffered chunk to a temp
    /// file before the new data is written; exceeding the absolute cap
    /// fails without touching the buffer.
    pub async fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let attempted = self.total_size + data.len() as u64;
        if attempted > self.max_file_size {
            return Err(BufferError::FileTooLarge {
                attempted,
                max: self.max_file_size,
            });
        }

        if self.mode == BufferMode::Memory && attempted > self.memory_threshold {
            self.spill_to_disk().await?;
        }

        match self.mode {
            BufferMode::Memory => {
                self.chunks.push(Bytes::copy_from_slice(data));
            }
            BufferMode::Hybrid => {
                let spool = self.spool.as_mut().expect("hybrid buffer has a spool");
                spool.file.write_all(data).await?;
                // Flush so preview/reader handles opened on the same path
                // observe every appended byte
                spool.file.flush().await?;
                spool.unsynced += data.len() as u64;
                if spool.unsynced >= SYNC_INTERVAL {
                    spool.file.sync_data().await?;
                    spool.unsynced = 0;
                }
            }
        }

        self.total_size = attempted;
        Ok(())
    }

    /// Returns the first `min(n, total_size)` bytes. Idempotent; never
    /// moves the append position.
    pub async fn preview(&self, n: usize) -> Result<Bytes, BufferError> {
        let want = (n as u64).min(self.total_size) as usize;
        match self.mode {
            BufferMode::Memory => {
                let mut out = BytesMut::with_capacity(want);
                for chunk in &self.chunks {
                    if out.len() >= want {
                        break;
                    }
                    let take = (want - out.len()).min(chunk.len());
                    out.extend_from_slice(&chunk[..take]);
                }
                Ok(out.freeze())
            }
            BufferMode::Hybrid => {
                let spool = self.spool.as_ref().expect("hybrid buffer has a spool");
                // A fresh read handle so the append handle is untouched
                let mut file = File::open(&spool.path).await?;
                let mut out = vec![0u8; want];
                file.read_exact(&mut out).await?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// A fresh, independent cursor over the buffer contents starting at
    /// `start_offset`. Works in both modes; each call returns a new cursor.
    pub fn reader(&self, start_offset: u64) -> BufferReader {
        let pos = start_offset.min(self.total_size);
        let source = match self.mode {
            BufferMode::Memory => ReaderSource::Memory {
                // Bytes clones are refcounted, not copies
                chunks: self.chunks.clone(),
            },
            BufferMode::Hybrid => ReaderSource::Disk {
                path: self
                    .spool
                    .as_ref()
                    .expect("hybrid buffer has a spool")
                    .path
                    .clone(),
                file: None,
            },
        };
        BufferReader {
            source,
            pos,
            len: self.total_size,
        }
    }

    pub fn stats(&self) -> BufferStats {
        let (memory_size, disk_size) = match self.mode {
            BufferMode::Memory => (self.total_size, 0),
            BufferMode::Hybrid => (0, self.total_size),
        };
        BufferStats {
            mode: self.mode,
            total_size: self.total_size,
            memory_size,
            disk_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Path of the spool file while in hybrid mode.
    pub fn spool_path(&self) -> Option<&Path> {
        self.spool.as_ref().map(|s| s.path.as_path())
    }

    /// Releases memory chunks and removes the spool file. Idempotent; the
    /// buffer must not be appended to afterwards.
    pub async fn clear(&mut self) {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
        if let Some(spool) = self.spool.take() {
            // Close before unlink
            drop(spool.file);
            if let Err(e) = tokio::fs::remove_file(&spool.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %spool.path.display(),
                        error = %e,
                        "Failed to remove spool file"
                    );
                }
            }
        }
    }

    /// Moves every in-memory chunk into a freshly created temp file and
    /// switches to hybrid mode. On failure the buffer keeps its memory
    /// contents unchanged.
    async fn spill_to_disk(&mut self) -> Result<(), BufferError> {
        let path = self.tmp_dir.join(spool_file_name());
        let result = write_spool(&path, &self.chunks).await;
        match result {
            Ok(file) => {
                tracing::debug!(
                    path = %path.display(),
                    bytes = self.total_size,
                    "Upload spilled to disk"
                );
                self.spool = Some(Spool {
                    path,
                    file,
                    unsynced: 0,
                });
                self.chunks = Vec::new();
                self.mode = BufferMode::Hybrid;
                Ok(())
            }
            Err(e) => {
                // Do not leave a partial spool behind
                let _ = tokio::fs::remove_file(&path).await;
                Err(BufferError::Io(e))
            }
        }
    }
}

impl Drop for SpoolBuffer {
    fn drop(&mut self) {
        // Backstop for paths that skip clear(); cleanup tasks normally get
        // there first.
        if let Some(spool) = self.spool.take() {
            let _ = std::fs::remove_file(&spool.path);
        }
    }
}

async fn write_spool(path: &Path, chunks: &[Bytes]) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    for chunk in chunks {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(file)
}

/// Unique per (pid, time, random) so concurrent requests never collide.
fn spool_file_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "avgate-{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

enum ReaderSource {
    Memory { chunks: Vec<Bytes> },
    Disk { path: PathBuf, file: Option<File> },
}

/// Independent cursor over a buffer snapshot; yields up to 128 KiB per
/// read until exhausted.
pub struct BufferReader {
    source: ReaderSource,
    pos: u64,
    len: u64,
}

impl BufferReader {
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.pos >= self.len {
            return Ok(None);
        }
        let want = ((self.len - self.pos) as usize).min(READER_CHUNK_SIZE);

        match &mut self.source {
            ReaderSource::Memory { chunks } => {
                let mut out = BytesMut::with_capacity(want);
                let mut skip = self.pos;
                for chunk in chunks.iter() {
                    if out.len() >= want {
                        break;
                    }
                    if skip >= chunk.len() as u64 {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    let start = skip as usize;
                    skip = 0;
                    let take = (want - out.len()).min(chunk.len() - start);
                    out.extend_from_slice(&chunk[start..start + take]);
                }
                self.pos += out.len() as u64;
                Ok(Some(out.freeze()))
            }
            ReaderSource::Disk { path, file } => {
                if file.is_none() {
                    let mut f = File::open(&*path).await?;
                    f.seek(SeekFrom::Start(self.pos)).await?;
                    *file = Some(f);
                }
                let f = file.as_mut().expect("reader file just opened");
                let mut out = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = f.read(&mut out[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
                if filled == 0 {
                    return Ok(None);
                }
                self.pos += filled as u64;
                Ok(Some(Bytes::from(out)))
            }
        }
    }

    /// Reads everything the cursor has left into one allocation.
    pub async fn read_to_end(mut self) -> std::io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Adapts the cursor into a byte stream for request bodies.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        stream::try_unfold(self, |mut reader| async move {
            match reader.next_chunk().await? {
                Some(chunk) => Ok(Some((chunk, reader))),
                None => Ok(None),
            }
        })
    }
}
