use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use http::Uri;
use serde::Deserialize;

pub(crate) mod logging;
use super::errors::{Error, Result};
use super::s3::logging::LoggingInterceptor;
use super::{
    ByteRange, Key, ListedObject, Listing, MultipartUpload, ObjectBody, ObjectMeta, ObjectStore,
    PartsPage, UploadMarker, UploadedPart, UploadsPage,
};

/// S3 refuses to complete an upload whose non-final parts are smaller than this.
pub(crate) const MIN_PART_SIZE: u64 = 5 << 20;

/// Largest page S3 returns from list and multi-object delete calls.
const LIST_MAX: usize = 1000;

fn default_scheme() -> String {
    String::from("https")
}

#[derive(Clone, Deserialize)]
pub struct S3Config {
    secret_key: String,
    access_key: String,
    hostname: String,
    bucket_name: String,
    region: String,
    #[serde(default = "default_scheme")]
    scheme: String,
    #[serde(default)]
    force_path_style: bool,
}

impl S3Config {
    pub async fn new_objects(&self) -> Result<S3> {
        let scp = SharedCredentialsProvider::new(
            Credentials::new(
                self.access_key.clone(),
                self.secret_key.clone(),
                None,
                None,
                "stowage",
            )
            .provide_credentials()
            .await?,
        );

        let uri = Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.hostname.as_str())
            .path_and_query("/")
            .build()?;

        let sdk_config = aws_config::load_from_env().await;

        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .region(Region::new(self.region.clone()))
            .credentials_provider(scp)
            .endpoint_url(uri.to_string())
            .force_path_style(self.force_path_style)
            .interceptor(LoggingInterceptor)
            .build();

        let s3_client = aws_sdk_s3::Client::from_conf(config);

        tracing::info!(
            "using s3 bucket {} at {}",
            self.bucket_name,
            uri.to_string()
        );

        Ok(S3 {
            bucket_name: self.bucket_name.clone(),
            client: s3_client,
        })
    }
}

#[derive(Clone)]
pub struct S3 {
    bucket_name: String,
    client: Client,
}

impl S3 {
    fn copy_source(&self, key: &Key) -> String {
        format!("{}/{}", &self.bucket_name, key)
    }
}

fn into_object_body(body: ByteStream) -> ObjectBody {
    futures::stream::try_unfold(body, |mut body| async move {
        Ok::<_, Error>(body.try_next().await?.map(|bytes| (bytes, body)))
    })
    .boxed()
}

fn to_chrono(dt: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn non_negative(n: Option<i64>) -> u64 {
    n.unwrap_or_default().max(0) as u64
}

#[async_trait]
impl ObjectStore for S3 {
    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }

    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        let get_object_output = self
            .client
            .get_object()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(into_object_body(get_object_output.body))
    }

    async fn get_range(&self, key: &Key, offset: u64) -> Result<ObjectBody> {
        let get_object_output = self
            .client
            .get_object()
            .key(key.as_str())
            .range(format!("bytes={offset}-"))
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(into_object_body(get_object_output.body))
    }

    async fn head(&self, key: &Key) -> Result<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: non_negative(output.content_length()),
                last_modified: output.last_modified().and_then(to_chrono),
                e_tag: output.e_tag().map(String::from),
            })),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        let content_length = body.len() as i64;
        let _put_object_output = self
            .client
            .put_object()
            .key(key.as_str())
            .body(ByteStream::from(body))
            .content_length(content_length)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.client
            .delete_object()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(LIST_MAX) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()?;

            let delete_objects_output = self
                .client
                .delete_objects()
                .delete(delete)
                .bucket(&self.bucket_name)
                .send()
                .await?;

            if let Some(failed) = delete_objects_output.errors().first() {
                return Err(Error::backend(
                    500,
                    failed.code().unwrap_or("Unknown"),
                    format!(
                        "failed to delete {}: {}",
                        failed.key().unwrap_or_default(),
                        failed.message().unwrap_or_default()
                    ),
                ));
            }
            tracing::debug!("deleted batch of {} keys", batch.len());
        }
        Ok(())
    }

    async fn copy(&self, source: &Key, destination: &Key) -> Result<()> {
        let _copy_object_output = self
            .client
            .copy_object()
            .copy_source(self.copy_source(source))
            .key(destination.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let page_size = match max_keys {
                Some(max) => max
                    .saturating_sub(listing.objects.len() + listing.common_prefixes.len())
                    .min(LIST_MAX),
                None => LIST_MAX,
            };

            let list_objects_output = self
                .client
                .list_objects_v2()
                .prefix(prefix)
                .set_delimiter(delimiter.map(String::from))
                .set_continuation_token(continuation_token.take())
                .max_keys(page_size as i32)
                .bucket(&self.bucket_name)
                .send()
                .await?;

            for object in list_objects_output.contents() {
                if let Some(key) = object.key() {
                    listing.objects.push(ListedObject {
                        key: key.to_string(),
                        size: non_negative(object.size()),
                        last_modified: object.last_modified().and_then(to_chrono),
                    });
                }
            }
            for common_prefix in list_objects_output.common_prefixes() {
                if let Some(p) = common_prefix.prefix() {
                    listing.common_prefixes.push(p.to_string());
                }
            }

            if let Some(max) = max_keys {
                if listing.objects.len() + listing.common_prefixes.len() >= max {
                    break;
                }
            }

            match (
                list_objects_output.is_truncated().unwrap_or(false),
                list_objects_output.next_continuation_token(),
            ) {
                (true, Some(token)) => continuation_token = Some(token.to_string()),
                (true, None) => {
                    return Err(Error::ProtocolViolation(String::from(
                        "truncated object listing without continuation token",
                    )))
                }
                (false, _) => break,
            }
        }

        Ok(listing)
    }

    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;
        Ok(presigned.uri().to_string())
    }

    async fn initiate_multipart_upload(&self, key: &Key) -> Result<String> {
        let create_multipart_upload_output = self
            .client
            .create_multipart_upload()
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let upload_id = create_multipart_upload_output
            .upload_id()
            .map(String::from)
            .ok_or(Error::MissingUploadId)?;

        tracing::debug!("initiated multipart upload {upload_id} for {key}");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        let size = body.len() as u64;
        let upload_part_output = self
            .client
            .upload_part()
            .upload_id(upload_id)
            .part_number(part_number)
            .key(key.as_str())
            .body(ByteStream::from(body))
            .content_length(size as i64)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let e_tag = upload_part_output
            .e_tag()
            .map(String::from)
            .ok_or(Error::MissingETag(part_number))?;

        Ok(UploadedPart {
            part_number,
            e_tag,
            size,
        })
    }

    async fn upload_part_copy(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        source: &Key,
        range: Option<ByteRange>,
    ) -> Result<UploadedPart> {
        // the copy response doesn't carry the part size
        let size = match range {
            Some(r) => r.len(),
            None => {
                self.head(source)
                    .await?
                    .ok_or_else(|| Error::backend(404, "NoSuchKey", source.to_string()))?
                    .size
            }
        };

        let upload_part_copy_output = self
            .client
            .upload_part_copy()
            .upload_id(upload_id)
            .part_number(part_number)
            .key(key.as_str())
            .copy_source(self.copy_source(source))
            .set_copy_source_range(range.map(|r| r.to_string()))
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let e_tag = upload_part_copy_output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(String::from)
            .ok_or(Error::MissingETag(part_number))?;

        Ok(UploadedPart {
            part_number,
            e_tag,
            size,
        })
    }

    async fn list_parts(
        &self,
        key: &Key,
        upload_id: &str,
        max_parts: i32,
        marker: Option<i32>,
    ) -> Result<PartsPage> {
        let list_parts_output = self
            .client
            .list_parts()
            .upload_id(upload_id)
            .key(key.as_str())
            .max_parts(max_parts)
            .set_part_number_marker(marker.map(|m| m.to_string()))
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let parts = list_parts_output
            .parts()
            .iter()
            .map(|p| {
                let part_number = p.part_number().ok_or_else(|| {
                    Error::ProtocolViolation(String::from("listed part without part number"))
                })?;
                Ok(UploadedPart {
                    part_number,
                    e_tag: p
                        .e_tag()
                        .map(String::from)
                        .ok_or(Error::MissingETag(part_number))?,
                    size: non_negative(p.size()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let next_marker = list_parts_output
            .next_part_number_marker()
            .map(|m| {
                m.parse::<i32>().map_err(|_| {
                    Error::ProtocolViolation(format!("invalid next part number marker: {m}"))
                })
            })
            .transpose()?;

        Ok(PartsPage {
            parts,
            truncated: list_parts_output.is_truncated().unwrap_or(false),
            next_marker,
        })
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        marker: Option<&UploadMarker>,
    ) -> Result<UploadsPage> {
        let list_multipart_uploads_output = self
            .client
            .list_multipart_uploads()
            .prefix(prefix)
            .set_key_marker(marker.map(|m| m.key.clone()))
            .set_upload_id_marker(marker.and_then(|m| m.upload_id.clone()))
            .max_uploads(LIST_MAX as i32)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let uploads = list_multipart_uploads_output
            .uploads()
            .iter()
            .filter_map(|u| {
                Some(MultipartUpload {
                    key: u.key()?.to_string(),
                    upload_id: u.upload_id()?.to_string(),
                })
            })
            .collect();

        let next_marker = list_multipart_uploads_output
            .next_key_marker()
            .map(|key| UploadMarker {
                key: key.to_string(),
                upload_id: list_multipart_uploads_output
                    .next_upload_id_marker()
                    .map(String::from),
            });

        Ok(UploadsPage {
            uploads,
            truncated: list_multipart_uploads_output
                .is_truncated()
                .unwrap_or(false),
            next_marker,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String> {
        let mut mpu = CompletedMultipartUpload::builder();
        for part in parts {
            mpu = mpu.parts(
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build(),
            );
        }
        let complete_multipart_upload_output = self
            .client
            .complete_multipart_upload()
            .multipart_upload(mpu.build())
            .upload_id(upload_id)
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(complete_multipart_upload_output
            .e_tag()
            .unwrap_or_default()
            .to_string())
    }

    async fn abort_multipart_upload(&self, key: &Key, upload_id: &str) -> Result<()> {
        let _abort_multipart_upload_output = self
            .client
            .abort_multipart_upload()
            .upload_id(upload_id)
            .key(key.as_str())
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(())
    }
}
