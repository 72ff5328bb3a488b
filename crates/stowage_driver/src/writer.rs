use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;

use stowage_objectstore::{Key, ObjectStore, UploadedPart};

use super::config::ChunkSizePolicy;
use super::errors::{Error, Result, StateError};
use super::pool::PartBufferPool;
use super::session::{SessionResolver, UploadSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Closed,
    Committed,
    Cancelled,
}

impl WriterState {
    fn ensure_open(self) -> Result<()> {
        match self {
            WriterState::Open => Ok(()),
            WriterState::Closed => Err(StateError::Closed.into()),
            WriterState::Committed => Err(StateError::Committed.into()),
            WriterState::Cancelled => Err(StateError::Cancelled.into()),
        }
    }
}

/// Whether the resumed session ends in a part the backend won't let us append after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Repair {
    NotNeeded,
    Required,
    Failed,
}

/// Whether a flush is producing the last part of the object or leaving the upload resumable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flush {
    /// An undersized `pending` remainder becomes its own, final part.
    Final,
    /// An undersized `pending` remainder is folded into `ready` so a later append starts from a
    /// part that satisfies the size floor.
    Resumable,
}

/// The two look-ahead buffers of a writer.
///
/// Incoming bytes fill `ready` first and `pending` second. A part is only cut from `ready` once
/// both are full, so the last two chunks of a stream are always still in memory when the
/// stream ends.
struct PartSlots {
    pool: Arc<PartBufferPool>,
    ready: Vec<u8>,
    pending: Vec<u8>,
}

impl PartSlots {
    fn new(pool: Arc<PartBufferPool>) -> Self {
        let ready = pool.acquire();
        let pending = pool.acquire();
        Self {
            pool,
            ready,
            pending,
        }
    }

    fn chunk_size(&self) -> usize {
        self.pool.chunk_size()
    }

    /// Copy as much of `p` as fits, returning how many bytes were taken.
    fn fill(&mut self, p: &[u8]) -> usize {
        let chunk_size = self.chunk_size();
        let slot = if self.ready.len() < chunk_size {
            &mut self.ready
        } else if self.pending.len() < chunk_size {
            &mut self.pending
        } else {
            return 0;
        };
        let n = std::cmp::min(chunk_size - slot.len(), p.len());
        slot.extend_from_slice(&p[..n]);
        n
    }

    fn is_full(&self) -> bool {
        self.ready.len() >= self.chunk_size() && self.pending.len() >= self.chunk_size()
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }

    fn merge_trailing(&mut self) {
        if !self.pending.is_empty() && self.pending.len() < self.chunk_size() {
            self.ready.extend_from_slice(&self.pending);
            self.pending.clear();
        }
    }

    /// Drop the contents of `ready` after it was uploaded and move `pending` up.
    fn shift(&mut self) {
        self.ready.clear();
        std::mem::swap(&mut self.ready, &mut self.pending);
    }

    fn clear(&mut self) {
        self.ready.clear();
        self.pending.clear();
    }
}

impl Drop for PartSlots {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.ready));
        self.pool.release(std::mem::take(&mut self.pending));
    }
}

/// Turns a stream of writes into the parts of a multipart upload.
///
/// A writer is opened either on a fresh upload session or, with `append`, on the session
/// already in flight for its key. It ends in exactly one of three ways:
///
/// * [`MultipartWriter::commit`] uploads what is buffered and completes the session, making
///   the object visible.
/// * [`MultipartWriter::cancel`] aborts the session and discards buffered bytes.
/// * [`MultipartWriter::close`] uploads what is buffered and leaves the session in flight so a
///   later writer can append to it.
///
/// Every call after that fails with [`Error::State`].
pub struct MultipartWriter {
    objects: Arc<dyn ObjectStore>,
    policy: ChunkSizePolicy,
    session: UploadSession,
    parts: Vec<UploadedPart>,
    slots: PartSlots,
    size: u64,
    state: WriterState,
    repair: Repair,
}

impl MultipartWriter {
    pub async fn open(
        objects: Arc<dyn ObjectStore>,
        policy: ChunkSizePolicy,
        pool: Arc<PartBufferPool>,
        key: &Key,
        append: bool,
    ) -> Result<Self> {
        let (session, parts) = SessionResolver::new(objects.as_ref())
            .open(key, append)
            .await?;
        let size = parts.iter().map(|p| p.size).sum();
        let repair = match parts.last() {
            Some(last) if last.size < policy.min_chunk_size() => Repair::Required,
            _ => Repair::NotNeeded,
        };
        Ok(Self {
            objects,
            policy,
            session,
            parts,
            slots: PartSlots::new(pool),
            size,
            state: WriterState::Open,
            repair,
        })
    }

    /// Total bytes of the object so far, including parts uploaded by earlier writers of a
    /// resumed session.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn parts(&self) -> &[UploadedPart] {
        &self.parts
    }

    /// Buffer `p`, uploading full parts along the way. On error the bytes consumed before the
    /// failure are still counted by [`MultipartWriter::size`].
    pub async fn write(&mut self, p: &[u8]) -> Result<usize> {
        self.state.ensure_open()?;
        if p.is_empty() {
            return Ok(0);
        }

        match self.repair {
            Repair::NotNeeded => {}
            Repair::Failed => return Err(Error::RepairFailed(self.session.key.to_string())),
            Repair::Required => match self.repair_session().await {
                Ok(()) => self.repair = Repair::NotNeeded,
                Err(e) => {
                    tracing::warn!("failed to repair upload for {}: {e}", self.session.key);
                    self.repair = Repair::Failed;
                    return Err(e);
                }
            },
        }

        let mut consumed = 0;
        while consumed < p.len() {
            if self.slots.is_full() {
                if let Err(e) = self.flush_part(Flush::Final).await {
                    self.size += consumed as u64;
                    return Err(e);
                }
            }
            consumed += self.slots.fill(&p[consumed..]);
        }
        self.size += consumed as u64;
        Ok(consumed)
    }

    /// Upload everything buffered but leave the session in flight.
    pub async fn close(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.state = WriterState::Closed;
        tracing::info!(
            "closing upload {} for {} at {} bytes",
            self.session.upload_id,
            self.session.key,
            self.size
        );
        self.flush_all(Flush::Resumable).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        if self.repair == Repair::Failed {
            return Err(Error::RepairFailed(self.session.key.to_string()));
        }
        self.flush_all(Flush::Final).await?;
        self.state = WriterState::Committed;

        let UploadSession { key, upload_id } = &self.session;
        if self.parts.is_empty() {
            tracing::info!("committing empty object {key}");
            self.abort_quietly().await;
            return Ok(self.objects.put(key, Bytes::new()).await?);
        }

        match self
            .objects
            .complete_multipart_upload(key, upload_id, &self.parts)
            .await
        {
            Ok(e_tag) => {
                tracing::info!(
                    "committed upload {upload_id} for {key}: {} parts, {} bytes, etag {e_tag}",
                    self.parts.len(),
                    self.size
                );
                Ok(())
            }
            Err(e) => {
                self.abort_quietly().await;
                Err(e.into())
            }
        }
    }

    /// Abort the session. Buffered bytes are discarded.
    pub async fn cancel(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.state = WriterState::Cancelled;
        self.slots.clear();

        let UploadSession { key, upload_id } = &self.session;
        tracing::info!("cancelling upload {upload_id} for {key}");
        match self.objects.abort_multipart_upload(key, upload_id).await {
            // already aborted, e.g. after a failed complete
            Err(e) if e.is_not_found() => Ok(()),
            result => Ok(result?),
        }
    }

    async fn abort_quietly(&self) {
        let UploadSession { key, upload_id } = &self.session;
        if let Err(e) = self.objects.abort_multipart_upload(key, upload_id).await {
            tracing::warn!("failed to abort upload {upload_id} for {key}: {e}");
        }
    }

    async fn flush_all(&mut self, mode: Flush) -> Result<()> {
        while !self.slots.is_empty() {
            self.flush_part(mode).await?;
        }
        Ok(())
    }

    /// Upload `ready` as the next part. Buffers and parts are untouched if the upload fails.
    async fn flush_part(&mut self, mode: Flush) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        if mode == Flush::Resumable {
            self.slots.merge_trailing();
        }

        let part_number = self.parts.len() as i32 + 1;
        let body = Bytes::copy_from_slice(&self.slots.ready);
        let part = self
            .objects
            .upload_part(
                &self.session.key,
                &self.session.upload_id,
                part_number,
                body,
            )
            .await?;
        tracing::debug!(
            "uploaded part {} of {} ({} bytes)",
            part.part_number,
            self.session.upload_id,
            part.size
        );
        self.parts.push(part);
        self.slots.shift();
        Ok(())
    }

    /// Replace a session that ends in an undersized part with a new one whose first part holds
    /// everything written so far.
    ///
    /// The old session is completed so its content becomes the object at our key. Small objects
    /// are then read back into `ready` and re-chunked; anything at or above the size floor is
    /// copied server-side into part 1 of the new session.
    async fn repair_session(&mut self) -> Result<()> {
        let UploadSession { key, upload_id } = self.session.clone();
        tracing::info!(
            "upload {upload_id} for {key} ends in an undersized part, starting a new session"
        );

        if let Err(e) = self
            .objects
            .complete_multipart_upload(&key, &upload_id, &self.parts)
            .await
        {
            self.abort_quietly().await;
            return Err(e.into());
        }

        self.session = SessionResolver::new(self.objects.as_ref())
            .initiate(&key)
            .await?;

        // The old content now lives only in the object at `key`; never leave a resumable
        // session behind that doesn't hold it.
        if let Err(e) = self.seed_session(&key).await {
            self.abort_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    /// Fill the freshly initiated session with the content of the object at `key`.
    async fn seed_session(&mut self, key: &Key) -> Result<()> {
        if self.size < self.policy.min_chunk_size() {
            self.parts.clear();
            let mut body = self.objects.get(key).await?;
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => self.slots.ready.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(e) => {
                        self.slots.clear();
                        return Err(e.into());
                    }
                }
            }
            tracing::debug!(
                "re-seeded upload {} with {} bytes of {key}",
                self.session.upload_id,
                self.slots.ready.len()
            );
        } else {
            let part = self
                .objects
                .upload_part_copy(key, &self.session.upload_id, 1, key, None)
                .await?;
            tracing::debug!(
                "copied {} bytes of {key} into part 1 of {}",
                part.size,
                self.session.upload_id
            );
            self.parts = vec![part];
        }
        Ok(())
    }
}
