use std::sync::{Mutex, MutexGuard};

/// Free list of part buffers shared by every writer of a driver.
///
/// Buffers are plain `Vec<u8>` with capacity for one chunk. The pool never tracks buffers that
/// are lent out, so a buffer that isn't released only costs an allocation later on. Released
/// buffers are zero-filled across their whole capacity before they become available again.
pub struct PartBufferPool {
    chunk_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl PartBufferPool {
    pub fn new(chunk_size: usize, max_idle: usize) -> Self {
        Self {
            chunk_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns an empty buffer with room for at least one chunk.
    pub fn acquire(&self) -> Vec<u8> {
        match self.idle().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.chunk_size),
        }
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.chunk_size {
            return;
        }
        buf.clear();
        buf.resize(buf.capacity(), 0);

        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }
}
