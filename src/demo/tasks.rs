//! Task types driven by the demo frame loop.
//!
//! The pipeline mirrors what an engine does with streamed world data: chunks are loaded on the
//! file access pool, checksummed on the short task pool, folded into one value on the long
//! task pool and finally "uploaded" on the main thread a few per frame.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    core::lock,
    task_system::{Task, TaskContext},
};

/// Chunk payloads shared between the stages. One slot per chunk.
pub(crate) struct ChunkStore {
    chunks: Vec<Mutex<Vec<u8>>>,
    checksums: Vec<AtomicU64>,
}

impl ChunkStore {
    pub(crate) fn new(chunk_count: usize) -> Self {
        Self {
            chunks: (0..chunk_count).map(|_| Mutex::new(Vec::new())).collect(),
            checksums: (0..chunk_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Produces the bytes of one chunk per invocation, as if read from disk.
pub(crate) struct ChunkLoadTask {
    store: Arc<ChunkStore>,
    chunk_size: usize,
    seed: u64,
    latency: Duration,
}

impl ChunkLoadTask {
    /// Creates a new chunk load task.
    ///
    /// # Arguments
    /// * `store` - Where the loaded chunks go
    /// * `chunk_size` - Bytes per chunk
    /// * `seed` - Base seed; every chunk derives its own from it
    /// * `latency` - Simulated read time per chunk
    pub(crate) fn new(
        store: Arc<ChunkStore>,
        chunk_size: usize,
        seed: u64,
        latency: Duration,
    ) -> Self {
        Self {
            store,
            chunk_size,
            seed,
            latency,
        }
    }
}

impl Task for ChunkLoadTask {
    fn execute(&self, ctx: &TaskContext<'_>) {
        if ctx.is_cancelled() {
            return;
        }

        let index = ctx.invocation() as usize;
        let mut rng = fastrand::Rng::with_seed(self.seed.wrapping_add(index as u64));
        let bytes: Vec<u8> = (0..self.chunk_size).map(|_| rng.u8(..)).collect();
        thread::sleep(self.latency);

        *lock(&self.store.chunks[index]) = bytes;
    }
}

/// Hashes one chunk per invocation.
pub(crate) struct ChecksumTask {
    store: Arc<ChunkStore>,
}

impl ChecksumTask {
    pub(crate) fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }
}

impl Task for ChecksumTask {
    fn execute(&self, ctx: &TaskContext<'_>) {
        let index = ctx.invocation() as usize;
        let checksum = fnv1a(&lock(&self.store.chunks[index]));
        self.store.checksums[index].store(checksum, Ordering::Release);
    }
}

/// Folds every chunk checksum into one value.
pub(crate) struct ReduceTask {
    store: Arc<ChunkStore>,
    total: Arc<AtomicU64>,
}

impl ReduceTask {
    pub(crate) fn new(store: Arc<ChunkStore>, total: Arc<AtomicU64>) -> Self {
        Self { store, total }
    }
}

impl Task for ReduceTask {
    fn execute(&self, _: &TaskContext<'_>) {
        let total = self
            .store
            .checksums
            .iter()
            .map(|checksum| checksum.load(Ordering::Acquire))
            .fold(0u64, |acc, checksum| acc.rotate_left(5) ^ checksum);
        self.total.store(total, Ordering::Release);
    }
}

/// Hands one chunk per invocation to the main thread.
pub(crate) struct UploadTask {
    store: Arc<ChunkStore>,
    uploaded: Arc<AtomicUsize>,
}

impl UploadTask {
    pub(crate) fn new(store: Arc<ChunkStore>, uploaded: Arc<AtomicUsize>) -> Self {
        Self { store, uploaded }
    }
}

impl Task for UploadTask {
    fn execute(&self, ctx: &TaskContext<'_>) {
        // Release the chunk's memory once it is "on the GPU".
        let bytes = std::mem::take(&mut *lock(&self.store.chunks[ctx.invocation() as usize]));
        log::trace!("Uploaded {} bytes for {}", bytes.len(), ctx.name());
        self.uploaded.fetch_add(1, Ordering::AcqRel);
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes
        .iter()
        .fold(OFFSET, |hash, &byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
