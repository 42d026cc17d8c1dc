//! The storage collaborator: a path based filesystem interface the
//! splitter, the tasks and the coordinator read and write through.
//!
//! Two backends are provided. [`LocalStorage`] maps paths onto a directory
//! of the local filesystem, [`S3Storage`] maps `s3://bucket/key` paths onto
//! an S3-compatible object store such as minio.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::error::Result;

mod local;
pub mod minio;

pub use local::LocalStorage;
pub use minio::S3Storage;

/// A readable, seekable byte stream returned by [`Storage::open`].
pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ReadSeek for T {}

pub type StorageReader = Box<dyn ReadSeek>;

pub type StorageWriter = Box<dyn ObjectWriter>;

/// A writable stream returned by [`Storage::create`].
///
/// Nothing is guaranteed to be durable until [`ObjectWriter::finish`]
/// returns successfully.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Metadata of one file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    /// Full storage path.
    pub path: String,
    pub name: String,
    pub owner: String,
    pub group: String,
    pub length: u64,
    pub replication: u16,
    pub is_directory: bool,
}

/// Where the bytes of one block of a file live. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u64,
    pub hosts: Vec<String>,
    pub names: Vec<String>,
}

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn open(&self, path: &str) -> Result<StorageReader>;

    /// Create (or truncate) a file, creating missing parent directories.
    async fn create(&self, path: &str) -> Result<StorageWriter>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool>;

    async fn mkdirs(&self, path: &str) -> Result<bool>;

    /// Returns `false` when the source does not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<bool>;

    async fn get_status(&self, path: &str) -> Result<FileStatus>;

    /// The children of a directory, ordered by name. A file lists itself.
    async fn list_status(&self, path: &str) -> Result<Vec<FileStatus>>;

    async fn block_locations(&self, path: &str) -> Result<Vec<BlockLocation>>;
}

/// Split a file of `length` bytes into blocks of `block_size`.
pub(crate) fn blocks_of(
    length: u64,
    block_size: u64,
    hosts: &[String],
    names: &[String],
) -> Vec<BlockLocation> {
    let block_size = block_size.max(1);
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < length {
        let block_len = block_size.min(length - offset);
        blocks.push(BlockLocation {
            offset,
            length: block_len,
            hosts: hosts.to_vec(),
            names: names.to_vec(),
        });
        offset += block_len;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cover_the_file() {
        let hosts = vec!["localhost".to_string()];
        let blocks = blocks_of(250, 100, &hosts, &hosts);
        assert_eq!(
            blocks.iter().map(|b| (b.offset, b.length)).collect::<Vec<_>>(),
            vec![(0, 100), (100, 100), (200, 50)]
        );
        assert!(blocks_of(0, 100, &hosts, &hosts).is_empty());
    }
}
