//! Helper functions and structures for dealing with minio, and the
//! [`Storage`] implementation on top of them.
//!
//! Object stores have no directories. A "directory" here is a key prefix
//! ending in `/`, it exists as long as at least one object lives below it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::byte_stream::Length;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use super::{blocks_of, BlockLocation, FileStatus, ObjectWriter, Storage, StorageReader, StorageWriter};
use crate::error::{MrError, Result};
use crate::utils::file_name;

const CHUNK_SIZE: u64 = 1024 * 1024 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKey {
    pub bucket: String,
    pub key: String,
}

/// Retrieves a bucket and key for a given path, the path should contain the s3 protocol.
pub fn path_to_bucket_key(path: &str) -> Result<BucketKey> {
    let s3_url =
        Url::parse(path).map_err(|e| MrError::Config(format!("could not parse `{path}`: {e}")))?;

    if s3_url.scheme() != "s3" {
        return Err(MrError::Config(format!("protocol of `{path}` is not s3")));
    }

    let bucket = s3_url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MrError::Config(format!("`{path}` names no bucket")))?;

    // we slice out the first `/` character
    let key = s3_url.path().trim_start_matches('/').trim_end_matches('/');

    Ok(BucketKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// id
    pub access_key_id: String,

    /// password
    pub secret_access_key: String,

    /// object store region
    pub region: String,

    /// minio url
    pub url: String,
}

/// Storage on an S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,

    /// Endpoint, reported as the block host.
    endpoint: String,

    /// Local directory for downloads and staged uploads.
    staging_dir: PathBuf,
}

struct ObjectEntry {
    key: String,
    size: u64,
}

impl S3Storage {
    pub fn from_conf(cfg: ClientConfig) -> Self {
        let cred = s3::config::Credentials::new(
            cfg.access_key_id,
            cfg.secret_access_key,
            None,
            None,
            "mrl",
        );
        let region = s3::config::Region::new(cfg.region);
        let conf = s3::config::Builder::new()
            .credentials_provider(cred)
            .region(region)
            .endpoint_url(cfg.url.clone())
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: s3::Client::from_conf(conf),
            endpoint: cfg.url,
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Size of the object at `key`, `None` when there is no such object.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        if key.is_empty() {
            return Ok(None);
        }
        let object_request = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match object_request {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    return Ok(None);
                }
                Err(MrError::unavailable(format!("s3://{bucket}/{key}"), err))
            }
        }
    }

    /// Lists objects and sub-prefixes directly below `prefix`.
    async fn list_dir(&self, bucket: &str, prefix: &str) -> Result<(Vec<ObjectEntry>, Vec<String>)> {
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        let mut objects = vec![];
        let mut prefixes = vec![];
        while let Some(result) = response.next().await {
            let output = result.map_err(|e| {
                MrError::unavailable(format!("s3://{bucket}/{prefix}"), e.into_service_error())
            })?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectEntry {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
            for common in output.common_prefixes() {
                if let Some(p) = common.prefix() {
                    prefixes.push(p.trim_end_matches('/').to_string());
                }
            }
        }

        Ok((objects, prefixes))
    }

    /// Lists every object below `prefix`, at any depth.
    async fn list_objects_in_dir(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = vec![];
        while let Some(result) = response.next().await {
            let output = result.map_err(|e| {
                MrError::unavailable(format!("s3://{bucket}/{prefix}"), e.into_service_error())
            })?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    objects.push(key.to_string());
                }
            }
        }

        Ok(objects)
    }

    async fn copy_object(&self, bucket: &str, source_key: &str, destination_key: &str) -> Result<()> {
        let copy_source = format!("{}/{}", bucket, source_key);

        self.client
            .copy_object()
            .bucket(bucket)
            .copy_source(copy_source)
            .key(destination_key)
            .send()
            .await
            .map_err(|e| {
                MrError::unavailable(format!("s3://{bucket}/{destination_key}"), e.into_service_error())
            })?;

        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| MrError::unavailable(format!("s3://{bucket}/{key}"), e.into_service_error()))?;
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, file_path: &Path) -> Result<()> {
        let target = format!("s3://{bucket}/{key}");
        let file_size = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| MrError::unavailable(&target, e))?
            .len();

        if file_size <= CHUNK_SIZE {
            let body = ByteStream::from_path(file_path)
                .await
                .map_err(|e| MrError::unavailable(&target, e))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| MrError::unavailable(&target, e.into_service_error()))?;
            return Ok(());
        }

        let multipart_upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| MrError::unavailable(&target, e.into_service_error()))?;
        let upload_id = multipart_upload
            .upload_id()
            .ok_or_else(|| MrError::unavailable(&target, anyhow!("no upload id returned")))?
            .to_string();

        let mut chunk_count = (file_size / CHUNK_SIZE) + 1;
        let mut size_of_last_chunk = file_size % CHUNK_SIZE;
        if size_of_last_chunk == 0 {
            size_of_last_chunk = CHUNK_SIZE;
            chunk_count -= 1;
        }

        let mut upload_parts = Vec::new();

        for chunk_index in 0..chunk_count {
            let this_chunk = if chunk_count - 1 == chunk_index {
                size_of_last_chunk
            } else {
                CHUNK_SIZE
            };
            let stream = ByteStream::read_from()
                .path(file_path)
                .offset(chunk_index * CHUNK_SIZE)
                .length(Length::Exact(this_chunk))
                .build()
                .await
                .map_err(|e| MrError::unavailable(&target, e))?;

            // Chunk index needs to start at 0, but part numbers start at 1.
            let part_number = (chunk_index as i32) + 1;
            let upload_part_res = self
                .client
                .upload_part()
                .key(key)
                .bucket(bucket)
                .upload_id(&upload_id)
                .body(stream)
                .part_number(part_number)
                .send()
                .await
                .map_err(|e| MrError::unavailable(&target, e.into_service_error()))?;

            upload_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag.unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(upload_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .multipart_upload(completed_multipart_upload)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| MrError::unavailable(&target, e.into_service_error()))?;

        debug!("uploaded {target} in {chunk_count} parts");
        Ok(())
    }
}

/// Stages writes in a local file and uploads it on `finish`.
struct S3Writer {
    storage: S3Storage,
    location: BucketKey,
    file: File,
    staged: tempfile::TempPath,
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| MrError::unavailable(self.staged.display().to_string(), e))
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| MrError::unavailable(self.staged.display().to_string(), e))?;
        self.storage
            .upload_file(&self.location.bucket, &self.location.key, &self.staged)
            .await
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn exists(&self, path: &str) -> Result<bool> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        if self.head(&bucket, &key).await?.is_some() {
            return Ok(true);
        }
        let (objects, prefixes) = self.list_dir(&bucket, &dir_prefix(&key)).await?;
        Ok(!objects.is_empty() || !prefixes.is_empty())
    }

    async fn open(&self, path: &str) -> Result<StorageReader> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let mut stream = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| MrError::unavailable(path, e.into_service_error()))?
            .body;

        let staged =
            tempfile::tempfile_in(&self.staging_dir).map_err(|e| MrError::unavailable(path, e))?;
        let mut file = File::from_std(staged);

        while let Some(bytes) = stream
            .try_next()
            .await
            .map_err(|e| MrError::unavailable(path, e))?
        {
            file.write_all(&bytes)
                .await
                .map_err(|e| MrError::unavailable(path, e))?;
        }
        file.flush().await.map_err(|e| MrError::unavailable(path, e))?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| MrError::unavailable(path, e))?;

        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<StorageWriter> {
        let location = path_to_bucket_key(path)?;
        let (file, staged) = tempfile::NamedTempFile::new_in(&self.staging_dir)
            .map_err(|e| MrError::unavailable(path, e))?
            .into_parts();

        Ok(Box::new(S3Writer {
            storage: self.clone(),
            location,
            file: File::from_std(file),
            staged,
        }))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        if self.head(&bucket, &key).await?.is_some() {
            self.delete_object(&bucket, &key).await?;
            return Ok(true);
        }

        let objects = self.list_objects_in_dir(&bucket, &dir_prefix(&key)).await?;
        if objects.is_empty() {
            return Ok(false);
        }
        if !recursive {
            return Err(MrError::unavailable(
                path,
                anyhow!("directory is not empty and delete is not recursive"),
            ));
        }
        for object in &objects {
            self.delete_object(&bucket, object).await?;
        }
        info!("deleted {} objects below {path}", objects.len());
        Ok(true)
    }

    async fn mkdirs(&self, _path: &str) -> Result<bool> {
        // Prefixes come into existence with their first object.
        Ok(true)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let source = path_to_bucket_key(from)?;
        let destination = path_to_bucket_key(to)?;
        if source.bucket != destination.bucket {
            return Err(MrError::Config(format!(
                "cannot rename across buckets: {from} -> {to}"
            )));
        }
        let bucket = &source.bucket;

        if self.head(bucket, &source.key).await?.is_some() {
            self.copy_object(bucket, &source.key, &destination.key).await?;
            self.delete_object(bucket, &source.key).await?;
            return Ok(true);
        }

        let source_prefix = dir_prefix(&source.key);
        let source_objects = self.list_objects_in_dir(bucket, &source_prefix).await?;
        if source_objects.is_empty() {
            return Ok(false);
        }
        for source_object in source_objects {
            let destination_key = format!(
                "{}{}",
                dir_prefix(&destination.key),
                source_object.trim_start_matches(&source_prefix)
            );
            self.copy_object(bucket, &source_object, &destination_key)
                .await?;
            self.delete_object(bucket, &source_object).await?;
        }
        Ok(true)
    }

    async fn get_status(&self, path: &str) -> Result<FileStatus> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let status = |length, is_directory| FileStatus {
            path: path.trim_end_matches('/').to_string(),
            name: file_name(path).to_string(),
            owner: String::new(),
            group: String::new(),
            length,
            replication: 1,
            is_directory,
        };

        if let Some(size) = self.head(&bucket, &key).await? {
            return Ok(status(size, false));
        }
        let (objects, prefixes) = self.list_dir(&bucket, &dir_prefix(&key)).await?;
        if key.is_empty() || !objects.is_empty() || !prefixes.is_empty() {
            return Ok(status(0, true));
        }
        Err(MrError::unavailable(path, anyhow!("no such object or prefix")))
    }

    async fn list_status(&self, path: &str) -> Result<Vec<FileStatus>> {
        let status = self.get_status(path).await?;
        if !status.is_directory {
            return Ok(vec![status]);
        }

        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let (objects, prefixes) = self.list_dir(&bucket, &dir_prefix(&key)).await?;
        let entry = |object_key: &str, length, is_directory| FileStatus {
            path: format!("s3://{bucket}/{object_key}"),
            name: file_name(object_key).to_string(),
            owner: String::new(),
            group: String::new(),
            length,
            replication: 1,
            is_directory,
        };

        let mut children: Vec<FileStatus> = objects
            .iter()
            .filter(|o| !o.key.ends_with('/'))
            .map(|o| entry(&o.key, o.size, false))
            .chain(prefixes.iter().map(|p| entry(p, 0, true)))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn block_locations(&self, path: &str) -> Result<Vec<BlockLocation>> {
        let status = self.get_status(path).await?;
        if status.is_directory {
            return Ok(vec![]);
        }
        let host = Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.endpoint.clone());
        // The whole object is one block served by the endpoint.
        Ok(blocks_of(
            status.length,
            status.length,
            &[host],
            &[self.endpoint.clone()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        assert_eq!(
            path_to_bucket_key("s3://data/input/a.txt").unwrap(),
            BucketKey {
                bucket: "data".into(),
                key: "input/a.txt".into()
            }
        );
        assert_eq!(path_to_bucket_key("s3://data/output/").unwrap().key, "output");
        assert_eq!(path_to_bucket_key("s3://data").unwrap().key, "");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(path_to_bucket_key("/local/path").is_err());
        assert!(path_to_bucket_key("http://data/x").is_err());
    }

    #[test]
    fn prefixes_end_in_a_slash() {
        assert_eq!(dir_prefix("out"), "out/");
        assert_eq!(dir_prefix(""), "");
    }
}
