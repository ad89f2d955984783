//! csend-chunks: plaintext chunk streams for the record cipher
//!
//! # Overview
//! - `slice`: fixed-size slicing of in-memory or on-disk sources
//! - `concat`: sequential concatenation of chunk streams
//! - `archive`: one or more files presented as a single payload plus manifest

pub mod archive;
pub mod concat;
pub mod slice;

pub use archive::{Archive, ArchiveFile, FileContent, ARCHIVE_MIME, ARCHIVE_NAME};
pub use concat::concat_streams;
pub use slice::{slice_stream, BlobSource, FileSource};
