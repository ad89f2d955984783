//! Chunk slicer over random-access byte sources
//!
//! A slicer yields `ceil(size / chunk_size)` chunks covering the source once,
//! in order. Every chunk is `chunk_size` long except possibly the last.
//! Reads never extend past the source's declared size, and nothing is read
//! until the consumer polls.

use bytes::Bytes;
use futures::{stream, StreamExt};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use csend_core::config::DEFAULT_READ_CHUNK_SIZE;
use csend_core::{ByteStream, SendError, SendResult};

/// A byte source with a known size that can be read at any offset.
pub trait BlobSource: Send + Sync + 'static {
    fn size(&self) -> u64;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> impl Future<Output = SendResult<Bytes>> + Send;
}

impl BlobSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> SendResult<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| SendError::Other(anyhow::anyhow!("offset {offset} out of range")))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                SendError::Other(anyhow::anyhow!(
                    "read {start}+{len} past end of {}-byte blob",
                    self.len()
                ))
            })?;
        Ok(self.slice(start..end))
    }
}

/// An on-disk file, sized when opened.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
    file: Mutex<tokio::fs::File>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> SendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        tracing::debug!(path = %path.display(), size, "opened file source");
        Ok(Self {
            path,
            size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> SendResult<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Slice `source` into a lazy stream of chunks. A `chunk_size` of 0 means
/// the default (64 KiB).
pub fn slice_stream<S: BlobSource>(source: S, chunk_size: usize) -> ByteStream {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_READ_CHUNK_SIZE
    } else {
        chunk_size
    };
    let size = source.size();

    stream::try_unfold((source, 0u64), move |(source, offset)| async move {
        if offset >= size {
            return Ok(None);
        }
        let len = (size - offset).min(chunk_size as u64) as usize;
        let chunk = source.read_at(offset, len).await?;
        if chunk.len() != len {
            return Err(SendError::Other(anyhow::anyhow!(
                "short read at offset {offset}: wanted {len}, got {}",
                chunk.len()
            )));
        }
        Ok(Some((chunk, (source, offset + len as u64))))
    })
    .boxed()
}
