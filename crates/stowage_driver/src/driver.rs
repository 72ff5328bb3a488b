use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};

use stowage_objectstore::{Key, ObjectBody, ObjectStore};

use super::config::{ChunkSizePolicy, DriverConfig};
use super::errors::{Error, Result};
use super::pool::PartBufferPool;
use super::writer::MultipartWriter;

pub const DRIVER_NAME: &str = "stowage";

/// Paths ending in one of these never name a directory, so a failed HEAD on them is final.
const FILE_SUFFIXES: [&str; 3] = ["/data", "/link", "/startedat"];

const DEFAULT_URL_EXPIRY_MINUTES: i64 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

#[derive(Clone, Debug, Default)]
pub struct UrlOptions {
    /// HTTP method the URL will be used with. Defaults to `GET`.
    pub method: Option<String>,
    /// When the URL stops working. Defaults to twenty minutes from now.
    pub expiry: Option<DateTime<Utc>>,
}

/// File-like view of an object store.
///
/// Paths are absolute and `/`-separated; the object key for a path is the path without its
/// leading `/`. Directories are implied by keys sharing a prefix.
#[derive(Clone)]
pub struct Driver {
    objects: Arc<dyn ObjectStore>,
    policy: ChunkSizePolicy,
    pool: Arc<PartBufferPool>,
}

impl Driver {
    pub fn new(objects: Arc<dyn ObjectStore>, config: &DriverConfig) -> Result<Self> {
        let policy = config.chunk_size_policy(objects.as_ref())?;
        let chunk_size = usize::try_from(policy.chunk_size()).map_err(|_| {
            Error::InvalidChunkSize {
                chunk_size: policy.chunk_size(),
                min_chunk_size: policy.min_chunk_size(),
            }
        })?;
        tracing::debug!(
            "driver using {} byte parts (backend minimum {})",
            policy.chunk_size(),
            policy.min_chunk_size()
        );
        Ok(Self {
            objects,
            policy,
            pool: Arc::new(PartBufferPool::new(chunk_size, config.max_idle_buffers())),
        })
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn chunk_size_policy(&self) -> ChunkSizePolicy {
        self.policy
    }

    fn key(path: &str) -> Result<Key> {
        Key::try_from(path.trim_start_matches('/')).map_err(|source| Error::InvalidPath {
            path: path.to_string(),
            source,
        })
    }

    /// Listing prefix for everything below `path`.
    fn dir_prefix(path: &str) -> Result<String> {
        if path.trim_start_matches('/').is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}/", Self::key(path.trim_end_matches('/'))?))
    }

    pub async fn get_content(&self, path: &str) -> Result<Bytes> {
        let key = Self::key(path)?;
        let body = self
            .objects
            .get(&key)
            .await
            .map_err(|e| Error::from(e).for_path(path))?;
        let content = body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(content.freeze())
    }

    pub async fn put_content(&self, path: &str, content: Bytes) -> Result<()> {
        let key = Self::key(path)?;
        tracing::debug!("putting {} bytes at {key}", content.len());
        Ok(self.objects.put(&key, content).await?)
    }

    /// Stream the content at `path` starting at `offset`. Reading from at or past the end of the
    /// object yields an empty stream.
    pub async fn reader(&self, path: &str, offset: u64) -> Result<ObjectBody> {
        let key = Self::key(path)?;
        match self.objects.get_range(&key, offset).await {
            Ok(body) => Ok(body),
            Err(e) if e.status() == Some(416) => Ok(futures::stream::empty().boxed()),
            Err(e) => Err(Error::from(e).for_path(path)),
        }
    }

    pub async fn writer(&self, path: &str, append: bool) -> Result<MultipartWriter> {
        let key = Self::key(path)?;
        MultipartWriter::open(
            self.objects.clone(),
            self.policy,
            self.pool.clone(),
            &key,
            append,
        )
        .await
        .map_err(|e| e.for_path(path))
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo> {
        let prefix = Self::dir_prefix(path)?;
        if !prefix.is_empty() {
            let key = Self::key(path)?;
            if let Some(meta) = self.objects.head(&key).await? {
                return Ok(FileInfo {
                    path: path.to_string(),
                    size: meta.size,
                    modified: meta.last_modified,
                    is_dir: false,
                });
            }
            if FILE_SUFFIXES.iter().any(|s| path.ends_with(s)) {
                return Err(Error::PathNotFound(path.to_string()));
            }
        }

        let listing = self.objects.list(&prefix, None, Some(1)).await?;
        if listing.is_empty() {
            return Err(Error::PathNotFound(path.to_string()));
        }
        Ok(FileInfo {
            path: path.to_string(),
            size: 0,
            modified: None,
            is_dir: true,
        })
    }

    /// Direct children of the directory at `path`, files before directories.
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = Self::dir_prefix(path)?;
        let listing = self.objects.list(&prefix, Some("/"), None).await?;
        if listing.is_empty() && !prefix.is_empty() {
            return Err(Error::PathNotFound(path.to_string()));
        }

        let files = listing.objects.into_iter().map(|o| format!("/{}", o.key));
        let dirs = listing
            .common_prefixes
            .into_iter()
            .map(|p| format!("/{}", p.trim_end_matches('/')));
        Ok(files.chain(dirs).collect())
    }

    pub async fn move_path(&self, source: &str, destination: &str) -> Result<()> {
        let src = Self::key(source)?;
        let dst = Self::key(destination)?;
        self.objects
            .copy(&src, &dst)
            .await
            .map_err(|e| Error::from(e).for_path(source))?;
        self.objects.delete(&src).await?;
        tracing::debug!("moved {src} to {dst}");
        Ok(())
    }

    /// Delete `path` and everything below it.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let prefix = Self::dir_prefix(path)?;

        let mut keys: Vec<String> = Vec::new();
        if self.objects.head(&key).await?.is_some() {
            keys.push(key.to_string());
        }
        let listing = self.objects.list(&prefix, None, None).await?;
        keys.extend(listing.objects.into_iter().map(|o| o.key));

        if keys.is_empty() {
            return Err(Error::PathNotFound(path.to_string()));
        }
        tracing::debug!("deleting {} keys under {key}", keys.len());
        Ok(self.objects.delete_many(&keys).await?)
    }

    pub async fn url_for(&self, path: &str, options: &UrlOptions) -> Result<String> {
        match options.method.as_deref() {
            None | Some("GET") => {}
            Some(method) => return Err(Error::UnsupportedMethod(method.to_string())),
        }
        let key = Self::key(path)?;

        let now = Utc::now();
        let expiry = options
            .expiry
            .unwrap_or(now + chrono::Duration::minutes(DEFAULT_URL_EXPIRY_MINUTES));
        let expires_in = (expiry - now).to_std().unwrap_or_default();
        Ok(self.objects.presign_get(&key, expires_in).await?)
    }
}
