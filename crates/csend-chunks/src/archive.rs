//! Files bundled for a single upload

use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};

use csend_core::types::{FileDescriptor, Manifest, ManifestFile, DEFAULT_MIME_TYPE};
use csend_core::{ByteStream, SendError, SendResult};

use crate::concat::concat_streams;
use crate::slice::{slice_stream, FileSource};

pub const ARCHIVE_NAME: &str = "Send-Archive.zip";
pub const ARCHIVE_MIME: &str = "send-archive";

#[derive(Debug, Clone)]
pub enum FileContent {
    Memory(Bytes),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ArchiveFile {
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub content: FileContent,
}

impl ArchiveFile {
    pub fn from_bytes(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime: None,
            content: FileContent::Memory(data),
        }
    }

    /// Stat a local file. The file is not opened until the archive is streamed.
    pub async fn from_path(path: impl AsRef<Path>) -> SendResult<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SendError::Other(anyhow::anyhow!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            size: meta.len(),
            mime: None,
            content: FileContent::Path(path.to_path_buf()),
        })
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn mime(&self) -> &str {
        self.mime.as_deref().unwrap_or(DEFAULT_MIME_TYPE)
    }

    fn stream(&self, chunk_size: usize) -> ByteStream {
        match &self.content {
            FileContent::Memory(data) => slice_stream(data.clone(), chunk_size),
            FileContent::Path(path) => {
                let path = path.clone();
                stream::once(async move { FileSource::open(path).await })
                    .map_ok(move |source| slice_stream(source, chunk_size))
                    .try_flatten()
                    .boxed()
            }
        }
    }
}

/// One or more files sent as a single encrypted payload.
///
/// The payload is the files' bytes back to back; the manifest in the
/// encrypted metadata is what lets a receiver split them again.
#[derive(Debug, Clone)]
pub struct Archive {
    files: Vec<ArchiveFile>,
}

impl Archive {
    pub fn new(files: Vec<ArchiveFile>) -> SendResult<Self> {
        if files.is_empty() {
            return Err(SendError::Other(anyhow::anyhow!(
                "an archive needs at least one file"
            )));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    pub fn name(&self) -> &str {
        match self.files.as_slice() {
            [single] => &single.name,
            _ => ARCHIVE_NAME,
        }
    }

    pub fn mime(&self) -> &str {
        match self.files.as_slice() {
            [single] => single.mime(),
            _ => ARCHIVE_MIME,
        }
    }

    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            files: self
                .files
                .iter()
                .map(|f| ManifestFile {
                    name: f.name.clone(),
                    size: f.size,
                    mime: f.mime().to_string(),
                })
                .collect(),
        }
    }

    /// The plaintext descriptor that gets encrypted into the upload metadata.
    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            name: self.name().to_string(),
            size: self.size(),
            mime: Some(self.mime().to_string()),
            manifest: self.manifest(),
        }
    }

    /// All file contents in order, sliced into `chunk_size` pieces.
    pub fn stream(&self, chunk_size: usize) -> ByteStream {
        concat_streams(self.files.iter().map(|f| f.stream(chunk_size)).collect())
    }
}
