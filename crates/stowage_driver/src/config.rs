use serde::Deserialize;

use stowage_objectstore::ObjectStore;

use super::errors::{Error, Result};

const DEFAULT_MAX_IDLE_BUFFERS: usize = 16;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DriverConfig {
    /// Target size of every uploaded part. Defaults to twice the backend minimum.
    pub chunk_size: Option<u64>,
    /// How many released part buffers the pool keeps around for reuse.
    pub max_idle_buffers: Option<usize>,
}

impl DriverConfig {
    pub fn chunk_size_policy(&self, objects: &dyn ObjectStore) -> Result<ChunkSizePolicy> {
        let min_chunk_size = objects.min_part_size();
        ChunkSizePolicy::new(
            min_chunk_size,
            self.chunk_size.unwrap_or(2 * min_chunk_size),
        )
    }

    pub fn max_idle_buffers(&self) -> usize {
        self.max_idle_buffers.unwrap_or(DEFAULT_MAX_IDLE_BUFFERS)
    }
}

/// The backend's part size floor paired with the size parts are cut at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSizePolicy {
    min_chunk_size: u64,
    chunk_size: u64,
}

impl ChunkSizePolicy {
    pub fn new(min_chunk_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size < min_chunk_size || chunk_size == 0 {
            return Err(Error::InvalidChunkSize {
                chunk_size,
                min_chunk_size,
            });
        }
        Ok(Self {
            min_chunk_size,
            chunk_size,
        })
    }

    #[inline]
    pub fn min_chunk_size(&self) -> u64 {
        self.min_chunk_size
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}
