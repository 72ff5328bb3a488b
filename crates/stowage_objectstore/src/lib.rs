use std::path::Component;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;

mod config;
pub use config::Config;
mod errors;
pub use errors::{Error, KeyError, Result};
pub mod memory;
pub use memory::MemoryStore;
pub(crate) mod s3;
pub use s3::S3Config;
pub use s3::S3;

/// A part that the backend has accepted into a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
    pub size: u64,
}

/// An in-flight multipart upload as reported by
/// [`ObjectStore::list_multipart_uploads`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

/// Resume position for [`ObjectStore::list_multipart_uploads`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadMarker {
    pub key: String,
    pub upload_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct UploadsPage {
    pub uploads: Vec<MultipartUpload>,
    pub truncated: bool,
    pub next_marker: Option<UploadMarker>,
}

#[derive(Debug, Default)]
pub struct PartsPage {
    pub parts: Vec<UploadedPart>,
    pub truncated: bool,
    pub next_marker: Option<i32>,
}

/// Inclusive byte range within an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub e_tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of [`ObjectStore::list`]: objects directly matching the prefix and the common
/// prefixes rolled up by the delimiter, if one was given.
#[derive(Debug, Default)]
pub struct Listing {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

/// A wrapper around [`std::path::PathBuf`] that rejects unsavory key names.
///
/// The following rules applied during the [`TryFrom<PathBuf>`] implementation:
///
/// * paths must not start with `/`
/// * paths are delimited by `/`
/// * paths are normalized (`//` are replaced with `/` and never end in `/`)
/// * paths must not contain relative segments (ie `.` or `..`)
/// * only characters explicitly documented as safe [in the S3
///   docs](https://docs.aws.amazon.com/AmazonS3/latest/userguide/object-keys.html) are allowed in
///   path segments
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    key: PathBuf,
}

impl Key {
    pub fn as_str(&self) -> &str {
        self.key.to_str().unwrap_or_default()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.key.display())
    }
}

impl TryFrom<PathBuf> for Key {
    type Error = Error;

    fn try_from(pb: PathBuf) -> Result<Key> {
        let key = pb
            .components()
            .try_fold(PathBuf::new(), validate_component)?;
        if key.as_os_str().is_empty() {
            return Err(KeyError::Empty.into());
        }
        Ok(Key { key })
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(s: &str) -> Result<Key> {
        Key::try_from(PathBuf::from(s))
    }
}

fn validate_component(mut pb: PathBuf, c: Component<'_>) -> std::result::Result<PathBuf, KeyError> {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-zA-Z0-9!_.*'()=+:@-]+$").expect("static regex is valid"));
    match c {
        Component::Prefix(_) => return Err(KeyError::PrefixNotAllowed),
        Component::RootDir => return Err(KeyError::RootDirNotAllowed),
        Component::CurDir => return Err(KeyError::CurDirNotAllowed),
        Component::ParentDir => return Err(KeyError::ParentDirNotAllowed),
        Component::Normal(s) => {
            if let Some(s) = s.to_str() {
                if !RE.is_match(s) {
                    return Err(KeyError::PathComponentsMustMatchRegex(
                        RE.as_str().to_string(),
                    ));
                }
            } else {
                return Err(KeyError::PathComponentsMustBeValidUnicode);
            }
        }
    }
    pb.push(c);
    Ok(pb)
}

pub type ObjectBody = BoxStream<'static, Result<Bytes>>;

/// Provides a common interface for interacting with different kinds of backend object stores.
///
/// Object retrieval methods return [`futures::stream::Stream`] over [`bytes::Bytes`]. Every
/// method is a single round trip to the backend (listing methods return one page per call)
/// except [`ObjectStore::list`], which follows continuation tokens itself.
///
/// The multipart methods mirror the S3 multipart upload API closely; implementations for
/// other backends are expected to enforce the same contract, in particular that every part but
/// the last one of a completed upload is at least [`ObjectStore::min_part_size`] bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Smallest size the backend accepts for any part of a multipart upload other than the last.
    fn min_part_size(&self) -> u64;

    async fn get(&self, key: &Key) -> Result<ObjectBody>;

    /// Read the object starting at `offset` through to its end.
    async fn get_range(&self, key: &Key, offset: u64) -> Result<ObjectBody>;

    /// Returns `None` when the object doesn't exist.
    async fn head(&self, key: &Key) -> Result<Option<ObjectMeta>>;

    async fn put(&self, key: &Key, body: Bytes) -> Result<()>;

    async fn delete(&self, key: &Key) -> Result<()>;

    /// Delete a batch of keys. Keys that don't exist are ignored.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    async fn copy(&self, source: &Key, destination: &Key) -> Result<()>;

    /// List keys under `prefix`, following continuation tokens until either the listing is
    /// exhausted or `max_keys` entries have been collected.
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<Listing>;

    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<String>;

    async fn initiate_multipart_upload(&self, key: &Key) -> Result<String>;

    async fn upload_part(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart>;

    /// Server-side copy of `source` (or the given range of it) into a part.
    async fn upload_part_copy(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        source: &Key,
        range: Option<ByteRange>,
    ) -> Result<UploadedPart>;

    async fn list_parts(
        &self,
        key: &Key,
        upload_id: &str,
        max_parts: i32,
        marker: Option<i32>,
    ) -> Result<PartsPage>;

    /// One page of in-flight multipart uploads. Backends are free to ignore `prefix`; callers
    /// that need an exact key must filter the result themselves.
    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        marker: Option<&UploadMarker>,
    ) -> Result<UploadsPage>;

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String>;

    async fn abort_multipart_upload(&self, key: &Key, upload_id: &str) -> Result<()>;
}
