use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{blocks_of, BlockLocation, FileStatus, ObjectWriter, Storage, StorageReader, StorageWriter};
use crate::error::{MrError, Result};
use crate::utils::join_path;

const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Storage backed by a directory of the local filesystem.
///
/// Storage paths are absolute (`/in/a.txt`) and resolve below `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    block_size: u64,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Block size reported by [`Storage::block_locations`].
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn status_from(&self, path: &str, meta: &std::fs::Metadata) -> FileStatus {
        let (owner, group) = owner_group(meta);
        FileStatus {
            path: path.to_string(),
            name: crate::utils::file_name(path).to_string(),
            owner,
            group,
            length: if meta.is_dir() { 0 } else { meta.len() },
            replication: 1,
            is_directory: meta.is_dir(),
        }
    }
}

#[cfg(unix)]
fn owner_group(meta: &std::fs::Metadata) -> (String, String) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid().to_string(), meta.gid().to_string())
}

#[cfg(not(unix))]
fn owner_group(_meta: &std::fs::Metadata) -> (String, String) {
    (String::new(), String::new())
}

struct LocalWriter {
    path: String,
    file: BufWriter<fs::File>,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| MrError::unavailable(&self.path, e))
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| MrError::unavailable(&self.path, e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| MrError::unavailable(&self.path, e))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| MrError::unavailable(path, e))
    }

    async fn open(&self, path: &str) -> Result<StorageReader> {
        let file = fs::File::open(self.resolve(path))
            .await
            .map_err(|e| MrError::unavailable(path, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<StorageWriter> {
        let local = self.resolve(path);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MrError::unavailable(path, e))?;
        }
        let file = fs::File::create(&local)
            .await
            .map_err(|e| MrError::unavailable(path, e))?;
        Ok(Box::new(LocalWriter {
            path: path.to_string(),
            file: BufWriter::new(file),
        }))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        let local = self.resolve(path);
        let meta = match fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MrError::unavailable(path, e)),
        };
        let removed = if meta.is_dir() && recursive {
            fs::remove_dir_all(&local).await
        } else if meta.is_dir() {
            fs::remove_dir(&local).await
        } else {
            fs::remove_file(&local).await
        };
        removed.map_err(|e| MrError::unavailable(path, e))?;
        debug!("deleted {path} (recursive={recursive})");
        Ok(true)
    }

    async fn mkdirs(&self, path: &str) -> Result<bool> {
        fs::create_dir_all(self.resolve(path))
            .await
            .map_err(|e| MrError::unavailable(path, e))?;
        Ok(true)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let source = self.resolve(from);
        if !fs::try_exists(&source)
            .await
            .map_err(|e| MrError::unavailable(from, e))?
        {
            return Ok(false);
        }
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MrError::unavailable(to, e))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| MrError::unavailable(to, e))?;
        Ok(true)
    }

    async fn get_status(&self, path: &str) -> Result<FileStatus> {
        let meta = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| MrError::unavailable(path, e))?;
        Ok(self.status_from(path, &meta))
    }

    async fn list_status(&self, path: &str) -> Result<Vec<FileStatus>> {
        let status = self.get_status(path).await?;
        if !status.is_directory {
            return Ok(vec![status]);
        }

        let mut entries = fs::read_dir(self.resolve(path))
            .await
            .map_err(|e| MrError::unavailable(path, e))?;
        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MrError::unavailable(path, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry
                .metadata()
                .await
                .map_err(|e| MrError::unavailable(path, e))?;
            children.push(self.status_from(&join_path(path, &name), &meta));
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn block_locations(&self, path: &str) -> Result<Vec<BlockLocation>> {
        let status = self.get_status(path).await?;
        if status.is_directory {
            return Ok(vec![]);
        }
        let hosts = vec!["localhost".to_string()];
        let names = vec!["127.0.0.1".to_string()];
        Ok(blocks_of(status.length, self.block_size, &hosts, &names))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::*;

    async fn write(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.create(path).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn create_open_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        write(&storage, "/in/nested/a.txt", b"hello world").await;
        assert!(storage.exists("/in/nested/a.txt").await.unwrap());

        let mut reader = storage.open("/in/nested/a.txt").await.unwrap();
        reader.seek(std::io::SeekFrom::Start(6)).await.unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "world");
    }

    #[tokio::test]
    async fn list_status_is_sorted_and_describes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write(&storage, "/in/b.txt", b"bb").await;
        write(&storage, "/in/a.txt", b"a").await;
        storage.mkdirs("/in/sub").await.unwrap();

        let listed = storage.list_status("/in").await.unwrap();
        let names: Vec<_> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(listed[1].length, 2);
        assert_eq!(listed[1].path, "/in/b.txt");
        assert!(listed[2].is_directory);

        let itself = storage.list_status("/in/a.txt").await.unwrap();
        assert_eq!(itself.len(), 1);
        assert_eq!(itself[0].replication, 1);
    }

    #[tokio::test]
    async fn delete_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write(&storage, "/out/_temporary/0_1/part", b"x").await;

        assert!(!storage.rename("/out/missing", "/out/elsewhere").await.unwrap());
        assert!(storage
            .rename("/out/_temporary/0_1/part", "/out/part")
            .await
            .unwrap());
        assert!(storage.exists("/out/part").await.unwrap());

        assert!(storage.delete("/out", true).await.unwrap());
        assert!(!storage.exists("/out").await.unwrap());
        assert!(!storage.delete("/out", true).await.unwrap());
    }

    #[tokio::test]
    async fn non_recursive_delete_of_a_full_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write(&storage, "/out/part", b"x").await;

        let err = storage.delete("/out", false).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceUnavailable);
        assert!(storage.exists("/out/part").await.unwrap());
    }

    #[tokio::test]
    async fn block_locations_follow_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).with_block_size(4);
        write(&storage, "/in/a.txt", b"0123456789").await;

        let blocks = storage.block_locations("/in/a.txt").await.unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].length, 2);
        assert_eq!(blocks[0].hosts, vec!["localhost".to_string()]);
    }

    #[tokio::test]
    async fn missing_paths_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.open("/nope").await.is_err());
        assert!(storage.get_status("/nope").await.is_err());
        assert!(!storage.exists("/nope").await.unwrap());
    }
}
