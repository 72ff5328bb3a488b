//! Upload session resolution.
//!
//! All durable session state lives in the backend: the upload id and the parts it has accepted.
//! Resuming a write therefore means finding the in-flight upload for a key and re-reading its
//! part list.
use stowage_objectstore::{Key, ObjectStore, UploadMarker, UploadedPart};

use super::errors::{Error, Result};

/// Page size requested from [`ObjectStore::list_parts`].
pub(crate) const LIST_PARTS_PAGE_SIZE: i32 = 1000;

/// An in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    pub key: Key,
    pub upload_id: String,
}

pub struct SessionResolver<'a> {
    objects: &'a dyn ObjectStore,
}

impl<'a> SessionResolver<'a> {
    pub fn new(objects: &'a dyn ObjectStore) -> Self {
        Self { objects }
    }

    /// Start a fresh session for `key`, or continue the one already in flight when `append` is
    /// set. Parts of a continued session are returned in ascending part number order.
    pub async fn open(
        &self,
        key: &Key,
        append: bool,
    ) -> Result<(UploadSession, Vec<UploadedPart>)> {
        if !append {
            return Ok((self.initiate(key).await?, Vec::new()));
        }

        let session = self
            .find_in_flight(key)
            .await?
            .ok_or_else(|| Error::PathNotFound(key.to_string()))?;
        let parts = self.list_parts(&session).await?;
        tracing::info!(
            "resuming upload {} for {} with {} parts",
            session.upload_id,
            key,
            parts.len()
        );
        Ok((session, parts))
    }

    pub async fn initiate(&self, key: &Key) -> Result<UploadSession> {
        let upload_id = self.objects.initiate_multipart_upload(key).await?;
        tracing::info!("started upload {upload_id} for {key}");
        Ok(UploadSession {
            key: key.clone(),
            upload_id,
        })
    }

    /// Walk every page of in-flight uploads looking for one whose key is exactly `key`.
    ///
    /// The key is passed along as a listing prefix, but not every backend honours it, so
    /// matches are always checked here.
    async fn find_in_flight(&self, key: &Key) -> Result<Option<UploadSession>> {
        let mut marker: Option<UploadMarker> = None;
        loop {
            let page = self
                .objects
                .list_multipart_uploads(key.as_str(), marker.as_ref())
                .await?;
            tracing::debug!(
                "scanned {} in-flight uploads looking for {}",
                page.uploads.len(),
                key
            );

            if let Some(upload) = page.uploads.into_iter().find(|u| u.key == key.as_str()) {
                return Ok(Some(UploadSession {
                    key: key.clone(),
                    upload_id: upload.upload_id,
                }));
            }

            if !page.truncated {
                return Ok(None);
            }
            if page.next_marker.is_none() || page.next_marker == marker {
                return Err(stowage_objectstore::Error::ProtocolViolation(String::from(
                    "truncated upload listing without a new marker",
                ))
                .into());
            }
            marker = page.next_marker;
        }
    }

    async fn list_parts(&self, session: &UploadSession) -> Result<Vec<UploadedPart>> {
        let mut parts: Vec<UploadedPart> = Vec::new();
        let mut marker: Option<i32> = None;
        loop {
            let page = self
                .objects
                .list_parts(
                    &session.key,
                    &session.upload_id,
                    LIST_PARTS_PAGE_SIZE,
                    marker,
                )
                .await?;
            parts.extend(page.parts);

            if !page.truncated {
                break;
            }
            if page.next_marker.is_none() || page.next_marker == marker {
                return Err(stowage_objectstore::Error::ProtocolViolation(String::from(
                    "truncated part listing without a new marker",
                ))
                .into());
            }
            marker = page.next_marker;
        }

        parts.sort_by_key(|p| p.part_number);
        parts.dedup_by_key(|p| p.part_number);
        Ok(parts)
    }
}
