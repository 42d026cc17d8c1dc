//! Input splitting.
//!
//! A split is a byte range of one input file. Ranges never care about line
//! boundaries; the map task reading a split realigns it (see
//! [`crate::map::read_split`]), so every line is read by exactly one split.

use std::fmt;

use globset::Glob;
use itertools::Itertools;
use tracing::{debug, info};

use common::storage::{FileStatus, Storage};
use common::utils::{file_name, parent_path};
use common::{MrError, Result};

/// How much larger than the target the final split of a file may grow
/// before the remainder becomes a split of its own.
pub const SPLIT_SLOP: f64 = 1.1;

/// A byte range of one input resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Split {
    pub resource: String,
    pub offset: u64,
    pub length: u64,
}

impl Split {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.resource, self.offset, self.length)
    }
}

/// Split every file named by `input` into ranges of about `target` bytes.
///
/// `input` is a file, a directory, or a directory followed by a glob over
/// file names. An input without any file yields a single empty split, so a
/// job over empty input still runs one (trivial) map task.
pub async fn split(storage: &dyn Storage, input: &str, target: u64) -> Result<Vec<Split>> {
    if target == 0 {
        return Err(MrError::Config("split size must be positive".into()));
    }

    let files = input_files(storage, input).await?;
    if files.is_empty() {
        info!("no input files under {input}");
        return Ok(vec![Split {
            resource: input.to_string(),
            offset: 0,
            length: 0,
        }]);
    }

    let mut splits = Vec::new();
    for file in &files {
        debug!(
            "input {} length={} owner={} group={} replication={}",
            file.path, file.length, file.owner, file.group, file.replication
        );
        let blocks = storage.block_locations(&file.path).await?;
        debug!(
            "blocks of {}: {}",
            file.path,
            blocks
                .iter()
                .map(|b| format!("{}+{}@{}", b.offset, b.length, b.hosts.join(",")))
                .join(" ")
        );
        splits.extend(split_file(&file.path, file.length, target));
    }

    info!(
        "split {} input files into {} splits",
        files.len(),
        splits.len()
    );
    Ok(splits)
}

/// Split one file of `length` bytes.
pub fn split_file(resource: &str, length: u64, target: u64) -> Vec<Split> {
    let target = target.max(1);
    if length == 0 {
        return vec![Split {
            resource: resource.to_string(),
            offset: 0,
            length: 0,
        }];
    }

    let mut splits = Vec::new();
    let mut offset = 0;
    let mut remaining = length;
    while remaining as f64 / target as f64 > SPLIT_SLOP {
        splits.push(Split {
            resource: resource.to_string(),
            offset,
            length: target,
        });
        offset += target;
        remaining -= target;
    }
    if remaining > 0 {
        splits.push(Split {
            resource: resource.to_string(),
            offset,
            length: remaining,
        });
    }
    splits
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

fn is_glob(name: &str) -> bool {
    name.contains(['*', '?', '[', '{'])
}

async fn input_files(storage: &dyn Storage, input: &str) -> Result<Vec<FileStatus>> {
    let name = file_name(input);
    if is_glob(name) {
        let matcher = Glob::new(name)
            .map_err(|e| MrError::Config(format!("bad input pattern `{name}`: {e}")))?
            .compile_matcher();
        let listed = storage.list_status(parent_path(input)).await?;
        return Ok(listed
            .into_iter()
            .filter(|s| !s.is_directory && !is_hidden(&s.name) && matcher.is_match(&s.name))
            .collect());
    }

    let status = storage.get_status(input).await?;
    if !status.is_directory {
        return Ok(vec![status]);
    }
    Ok(storage
        .list_status(input)
        .await?
        .into_iter()
        .filter(|s| !s.is_directory && !is_hidden(&s.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use common::storage::LocalStorage;

    use super::*;

    async fn write(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.create(path).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[test]
    fn ranges_cover_the_file() {
        let splits = split_file("/in/a", 250, 100);
        assert_eq!(
            splits.iter().map(|s| (s.offset, s.length)).collect::<Vec<_>>(),
            vec![(0, 100), (100, 100), (200, 50)]
        );
    }

    #[test]
    fn small_remainder_is_absorbed() {
        let splits = split_file("/in/a", 205, 100);
        assert_eq!(
            splits.iter().map(|s| (s.offset, s.length)).collect::<Vec<_>>(),
            vec![(0, 100), (100, 105)]
        );
    }

    #[test]
    fn empty_file_gives_one_empty_split() {
        let splits = split_file("/in/empty", 0, 100);
        assert_eq!(splits.len(), 1);
        assert!(splits[0].is_empty());
    }

    #[tokio::test]
    async fn directories_skip_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write(&storage, "/in/b.txt", b"bbbb").await;
        write(&storage, "/in/a.txt", b"aa").await;
        write(&storage, "/in/_SUCCESS", b"").await;
        write(&storage, "/in/.crc", b"x").await;

        let splits = split(&storage, "/in", 64).await.unwrap();
        let resources: Vec<_> = splits.iter().map(|s| s.resource.as_str()).collect();
        assert_eq!(resources, vec!["/in/a.txt", "/in/b.txt"]);
    }

    #[tokio::test]
    async fn globs_match_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write(&storage, "/in/a.txt", b"aa").await;
        write(&storage, "/in/b.csv", b"bb").await;

        let splits = split(&storage, "/in/*.txt", 64).await.unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].resource, "/in/a.txt");
    }

    #[tokio::test]
    async fn input_without_files_yields_one_empty_split() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.mkdirs("/in").await.unwrap();

        let splits = split(&storage, "/in", 64).await.unwrap();
        assert_eq!(splits.len(), 1);
        assert!(splits[0].is_empty());
    }

    #[tokio::test]
    async fn missing_input_and_zero_target_fail() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let err = split(&storage, "/nope", 64).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::ResourceUnavailable);
        let err = split(&storage, "/nope", 0).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Config);
    }
}
