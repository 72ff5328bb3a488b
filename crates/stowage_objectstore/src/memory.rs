//! In-process [`ObjectStore`] that keeps everything in memory.
//!
//! Enforces the parts of the S3 multipart contract that matter to callers: part numbers are
//! validated against what was uploaded, etags must match, every part but the last must be at
//! least `min_part_size` bytes and an upload can't be completed without parts. Listings are
//! paged so callers exercise their continuation handling.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use uuid::Uuid;

use super::errors::{Error, Result};
use super::{
    ByteRange, Key, ListedObject, Listing, MultipartUpload, ObjectBody, ObjectMeta, ObjectStore,
    PartsPage, UploadMarker, UploadedPart, UploadsPage,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

struct StoredObject {
    data: Bytes,
    e_tag: String,
    last_modified: DateTime<Utc>,
}

struct StoredPart {
    data: Bytes,
    e_tag: String,
}

struct PendingUpload {
    key: String,
    initiated: u64,
    parts: BTreeMap<i32, StoredPart>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: BTreeMap<String, PendingUpload>,
    initiated: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    min_part_size: u64,
    page_size: usize,
    state: Arc<Mutex<State>>,
}

fn compute_etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn no_such_key(key: &str) -> Error {
    Error::backend(404, "NoSuchKey", format!("no such key: {key}"))
}

fn no_such_upload(upload_id: &str) -> Error {
    Error::backend(404, "NoSuchUpload", format!("no such upload: {upload_id}"))
}

fn single_chunk(data: Bytes) -> ObjectBody {
    stream::iter(std::iter::once(Ok(data))).boxed()
}

impl MemoryStore {
    pub fn new(min_part_size: u64) -> Self {
        Self {
            min_part_size,
            page_size: DEFAULT_PAGE_SIZE,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Limit every listing call to `page_size` entries per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn object_data(&self, key: &Key) -> Result<Bytes> {
        self.lock()
            .objects
            .get(key.as_str())
            .map(|o| o.data.clone())
            .ok_or_else(|| no_such_key(key.as_str()))
    }

    fn store_part(
        &self,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<UploadedPart> {
        if !(1..=10000).contains(&part_number) {
            return Err(Error::backend(
                400,
                "InvalidArgument",
                format!("part number {part_number} out of range"),
            ));
        }
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let e_tag = compute_etag(&data);
        let size = data.len() as u64;
        upload.parts.insert(
            part_number,
            StoredPart {
                data,
                e_tag: e_tag.clone(),
            },
        );
        Ok(UploadedPart {
            part_number,
            e_tag,
            size,
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        Ok(single_chunk(self.object_data(key)?))
    }

    async fn get_range(&self, key: &Key, offset: u64) -> Result<ObjectBody> {
        let data = self.object_data(key)?;
        if offset >= data.len() as u64 && offset > 0 {
            return Err(Error::backend(
                416,
                "InvalidRange",
                format!("offset {offset} beyond end of {key}"),
            ));
        }
        Ok(single_chunk(data.slice(offset as usize..)))
    }

    async fn head(&self, key: &Key) -> Result<Option<ObjectMeta>> {
        Ok(self.lock().objects.get(key.as_str()).map(|o| ObjectMeta {
            size: o.data.len() as u64,
            last_modified: Some(o.last_modified),
            e_tag: Some(o.e_tag.clone()),
        }))
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        let e_tag = compute_etag(&body);
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                e_tag,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.lock().objects.remove(key.as_str());
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut state = self.lock();
        for key in keys {
            state.objects.remove(key);
        }
        Ok(())
    }

    async fn copy(&self, source: &Key, destination: &Key) -> Result<()> {
        let data = self.object_data(source)?;
        self.put(destination, data).await
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<Listing> {
        let state = self.lock();
        let mut listing = Listing::default();
        let limit = max_keys.unwrap_or(usize::MAX);

        for (key, object) in state.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if listing.objects.len() + listing.common_prefixes.len() >= limit {
                break;
            }
            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|i| i + d.len())) {
                Some(end) => {
                    let common_prefix = format!("{prefix}{}", &rest[..end]);
                    if listing.common_prefixes.last() != Some(&common_prefix) {
                        listing.common_prefixes.push(common_prefix);
                    }
                }
                None => listing.objects.push(ListedObject {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: Some(object.last_modified),
                }),
            }
        }
        Ok(listing)
    }

    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<String> {
        let expires = Utc::now() + chrono::Duration::seconds(expires_in.as_secs() as i64);
        Ok(format!("memory:///{key}?expires={}", expires.timestamp()))
    }

    async fn initiate_multipart_upload(&self, key: &Key) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.initiated += 1;
        let initiated = state.initiated;
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                initiated,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &Key,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        self.store_part(upload_id, part_number, body)
    }

    async fn upload_part_copy(
        &self,
        _key: &Key,
        upload_id: &str,
        part_number: i32,
        source: &Key,
        range: Option<ByteRange>,
    ) -> Result<UploadedPart> {
        let data = self.object_data(source)?;
        let data = match range {
            Some(r) if r.end >= data.len() as u64 || r.is_empty() => {
                return Err(Error::backend(
                    416,
                    "InvalidRange",
                    format!("copy range {r} outside of {source}"),
                ))
            }
            Some(r) => data.slice(r.start as usize..=r.end as usize),
            None => data,
        };
        self.store_part(upload_id, part_number, data)
    }

    async fn list_parts(
        &self,
        _key: &Key,
        upload_id: &str,
        max_parts: i32,
        marker: Option<i32>,
    ) -> Result<PartsPage> {
        let state = self.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let page_size = (max_parts.max(1) as usize).min(self.page_size);

        let mut remaining = upload
            .parts
            .range(marker.map(|m| m + 1).unwrap_or(i32::MIN)..)
            .map(|(number, part)| UploadedPart {
                part_number: *number,
                e_tag: part.e_tag.clone(),
                size: part.data.len() as u64,
            });
        let parts: Vec<UploadedPart> = remaining.by_ref().take(page_size).collect();
        let truncated = remaining.next().is_some();
        let next_marker = if truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };

        Ok(PartsPage {
            parts,
            truncated,
            next_marker,
        })
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        marker: Option<&UploadMarker>,
    ) -> Result<UploadsPage> {
        let state = self.lock();

        // ordered by key, then by initiation like S3 does
        let mut all: Vec<(&String, u64, &String)> = state
            .uploads
            .iter()
            .filter(|(_, u)| u.key.starts_with(prefix))
            .map(|(id, u)| (&u.key, u.initiated, id))
            .collect();
        all.sort();

        let start = match marker {
            None => 0,
            Some(m) => m
                .upload_id
                .as_ref()
                .and_then(|upload_id| {
                    all.iter()
                        .position(|(key, _, id)| **key == m.key && *id == upload_id)
                        .map(|i| i + 1)
                })
                .unwrap_or_else(|| {
                    all.iter()
                        .position(|(key, _, _)| key.as_str() > m.key.as_str())
                        .unwrap_or(all.len())
                }),
        };

        let page: Vec<&(&String, u64, &String)> =
            all[start..].iter().take(self.page_size).collect();
        let truncated = start + page.len() < all.len();
        let next_marker = if truncated {
            page.last().map(|(key, _, id)| UploadMarker {
                key: key.to_string(),
                upload_id: Some(id.to_string()),
            })
        } else {
            None
        };

        Ok(UploadsPage {
            uploads: page
                .into_iter()
                .map(|(key, _, id)| MultipartUpload {
                    key: key.to_string(),
                    upload_id: id.to_string(),
                })
                .collect(),
            truncated,
            next_marker,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(Error::backend(
                400,
                "MalformedXML",
                "complete requires at least one part",
            ));
        }

        let mut combined = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len() * 16);
        let mut previous = 0;
        for (i, completed) in parts.iter().enumerate() {
            if completed.part_number <= previous {
                return Err(Error::backend(
                    400,
                    "InvalidPartOrder",
                    format!("part {} listed out of order", completed.part_number),
                ));
            }
            previous = completed.part_number;

            let part = upload
                .parts
                .get(&completed.part_number)
                .filter(|p| p.e_tag == completed.e_tag)
                .ok_or_else(|| {
                    Error::backend(
                        400,
                        "InvalidPart",
                        format!("part {} not found or etag mismatch", completed.part_number),
                    )
                })?;

            let is_last = i + 1 == parts.len();
            if !is_last && (part.data.len() as u64) < self.min_part_size {
                return Err(Error::backend(
                    400,
                    "EntityTooSmall",
                    format!(
                        "part {} is {} bytes, smaller than the minimum of {}",
                        completed.part_number,
                        part.data.len(),
                        self.min_part_size
                    ),
                ));
            }
            combined.extend_from_slice(&part.data);
            digests.extend_from_slice(&Md5::digest(&part.data));
        }

        let e_tag = format!("\"{}-{}\"", hex::encode(Md5::digest(&digests)), parts.len());
        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: combined.freeze(),
                e_tag: e_tag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(e_tag)
    }

    async fn abort_multipart_upload(&self, _key: &Key, upload_id: &str) -> Result<()> {
        self.lock()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }
}
