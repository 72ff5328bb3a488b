use std::sync::Arc;

use serde::Deserialize;

use super::memory::MemoryStore;
use super::ObjectStore;
use super::Result;

#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Config {
    S3(super::s3::S3Config),
    Memory {
        #[serde(default = "default_memory_min_part_size")]
        min_part_size: u64,
    },
}

fn default_memory_min_part_size() -> u64 {
    super::s3::MIN_PART_SIZE
}

impl Config {
    pub async fn new_objects(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::S3(cfg) => Ok(Arc::new(cfg.new_objects().await?)),
            Self::Memory { min_part_size } => Ok(Arc::new(MemoryStore::new(*min_part_size))),
        }
    }
}
