#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;

use stowage_driver::{ChunkSizePolicy, Driver, DriverConfig, MultipartWriter, PartBufferPool};
use stowage_objectstore::{
    ByteRange, Error, Key, Listing, MemoryStore, ObjectBody, ObjectMeta, ObjectStore, PartsPage,
    Result, UploadMarker, UploadedPart, UploadsPage,
};

/// A call made against [`TestStore`], with the arguments tests care about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Get,
    GetRange(u64),
    Head,
    Put(usize),
    Delete,
    DeleteMany(usize),
    Copy,
    List,
    Presign,
    Initiate,
    UploadPart { part_number: i32, size: u64 },
    UploadPartCopy { part_number: i32 },
    ListParts(Option<i32>),
    ListUploads,
    Complete(Vec<(i32, u64)>),
    Abort,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::GetRange(_) => "get_range",
            Op::Head => "head",
            Op::Put(_) => "put",
            Op::Delete => "delete",
            Op::DeleteMany(_) => "delete_many",
            Op::Copy => "copy",
            Op::List => "list",
            Op::Presign => "presign_get",
            Op::Initiate => "initiate_multipart_upload",
            Op::UploadPart { .. } => "upload_part",
            Op::UploadPartCopy { .. } => "upload_part_copy",
            Op::ListParts(_) => "list_parts",
            Op::ListUploads => "list_multipart_uploads",
            Op::Complete(_) => "complete_multipart_upload",
            Op::Abort => "abort_multipart_upload",
        }
    }
}

/// [`MemoryStore`] wrapper that records every call and can be told to fail some of them.
#[derive(Clone)]
pub struct TestStore {
    pub inner: MemoryStore,
    ops: Arc<Mutex<Vec<Op>>>,
    failures: Arc<Mutex<HashMap<&'static str, usize>>>,
    reverse_part_pages: bool,
    ignore_upload_prefix: bool,
}

impl TestStore {
    pub fn new(min_part_size: u64) -> Self {
        Self::wrap(MemoryStore::new(min_part_size))
    }

    pub fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            ops: Arc::default(),
            failures: Arc::default(),
            reverse_part_pages: false,
            ignore_upload_prefix: false,
        }
    }

    /// Hand back every page of [`ObjectStore::list_parts`] in descending part order.
    pub fn reversing_part_pages(mut self) -> Self {
        self.reverse_part_pages = true;
        self
    }

    /// List in-flight uploads for every key, like backends that don't filter by prefix.
    pub fn ignoring_upload_prefix(mut self) -> Self {
        self.ignore_upload_prefix = true;
        self
    }

    /// Make the next `times` calls to the method called `op` fail with a transport error.
    pub fn fail(&self, op: &'static str, times: usize) {
        self.failures.lock().unwrap().insert(op, times);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn count(&self, op: &'static str) -> usize {
        self.ops().iter().filter(|o| o.name() == op).count()
    }

    /// Sizes of every part submitted to a successful or failed complete call, in order.
    pub fn completed(&self) -> Vec<Vec<(i32, u64)>> {
        self.ops()
            .into_iter()
            .filter_map(|o| match o {
                Op::Complete(parts) => Some(parts),
                _ => None,
            })
            .collect()
    }

    pub fn uploaded_part_sizes(&self) -> Vec<u64> {
        self.ops()
            .into_iter()
            .filter_map(|o| match o {
                Op::UploadPart { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Op) -> Result<()> {
        let name = op.name();
        self.ops.lock().unwrap().push(op);
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(name) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(Error::Transport(format!("injected {name} failure")))
            }
            _ => Ok(()),
        }
    }

    pub async fn content(&self, key: &str) -> Option<Vec<u8>> {
        let body = self.inner.get(&key_of(key)).await.ok()?;
        Some(read_all(body).await)
    }
}

#[async_trait]
impl ObjectStore for TestStore {
    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size()
    }

    async fn get(&self, key: &Key) -> Result<ObjectBody> {
        self.record(Op::Get)?;
        self.inner.get(key).await
    }

    async fn get_range(&self, key: &Key, offset: u64) -> Result<ObjectBody> {
        self.record(Op::GetRange(offset))?;
        self.inner.get_range(key, offset).await
    }

    async fn head(&self, key: &Key) -> Result<Option<ObjectMeta>> {
        self.record(Op::Head)?;
        self.inner.head(key).await
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        self.record(Op::Put(body.len()))?;
        self.inner.put(key, body).await
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.record(Op::Delete)?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.record(Op::DeleteMany(keys.len()))?;
        self.inner.delete_many(keys).await
    }

    async fn copy(&self, source: &Key, destination: &Key) -> Result<()> {
        self.record(Op::Copy)?;
        self.inner.copy(source, destination).await
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<Listing> {
        self.record(Op::List)?;
        self.inner.list(prefix, delimiter, max_keys).await
    }

    async fn presign_get(&self, key: &Key, expires_in: Duration) -> Result<String> {
        self.record(Op::Presign)?;
        self.inner.presign_get(key, expires_in).await
    }

    async fn initiate_multipart_upload(&self, key: &Key) -> Result<String> {
        self.record(Op::Initiate)?;
        self.inner.initiate_multipart_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        self.record(Op::UploadPart {
            part_number,
            size: body.len() as u64,
        })?;
        self.inner
            .upload_part(key, upload_id, part_number, body)
            .await
    }

    async fn upload_part_copy(
        &self,
        key: &Key,
        upload_id: &str,
        part_number: i32,
        source: &Key,
        range: Option<ByteRange>,
    ) -> Result<UploadedPart> {
        self.record(Op::UploadPartCopy { part_number })?;
        self.inner
            .upload_part_copy(key, upload_id, part_number, source, range)
            .await
    }

    async fn list_parts(
        &self,
        key: &Key,
        upload_id: &str,
        max_parts: i32,
        marker: Option<i32>,
    ) -> Result<PartsPage> {
        self.record(Op::ListParts(marker))?;
        let mut page = self
            .inner
            .list_parts(key, upload_id, max_parts, marker)
            .await?;
        if self.reverse_part_pages {
            page.parts.reverse();
        }
        Ok(page)
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        marker: Option<&UploadMarker>,
    ) -> Result<UploadsPage> {
        self.record(Op::ListUploads)?;
        let prefix = if self.ignore_upload_prefix { "" } else { prefix };
        self.inner.list_multipart_uploads(prefix, marker).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String> {
        self.record(Op::Complete(
            parts.iter().map(|p| (p.part_number, p.size)).collect(),
        ))?;
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &Key, upload_id: &str) -> Result<()> {
        self.record(Op::Abort)?;
        self.inner.abort_multipart_upload(key, upload_id).await
    }
}

pub fn key_of(s: &str) -> Key {
    Key::try_from(s).unwrap()
}

pub async fn read_all(body: ObjectBody) -> Vec<u8> {
    body.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
    .unwrap()
}

/// Deterministic content so part boundaries are visible when comparing bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn pool(chunk_size: u64) -> Arc<PartBufferPool> {
    Arc::new(PartBufferPool::new(chunk_size as usize, 4))
}

pub async fn open_writer(
    store: &TestStore,
    min_chunk_size: u64,
    chunk_size: u64,
    key: &str,
    append: bool,
) -> stowage_driver::Result<MultipartWriter> {
    MultipartWriter::open(
        Arc::new(store.clone()),
        ChunkSizePolicy::new(min_chunk_size, chunk_size).unwrap(),
        pool(chunk_size),
        &key_of(key),
        append,
    )
    .await
}

pub fn driver(store: &TestStore, chunk_size: Option<u64>) -> Driver {
    Driver::new(
        Arc::new(store.clone()),
        &DriverConfig {
            chunk_size,
            max_idle_buffers: None,
        },
    )
    .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
