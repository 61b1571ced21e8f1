//! ForgeHash: the pool's proof-of-work verification capability
//!
//! The pool never mines; it only verifies. Verification needs a large
//! per-epoch dataset, so the work is split in two:
//!
//!   GENERATE (once per epoch, expensive): derive the epoch seed, then fill
//!     `dataset_size` bytes in 64-byte chunks where
//!     chunk[i] = Blake3(seed || i) || Blake3(Blake3(seed || i) || i).
//!     Chunks are independent, so the fill is split across CPU threads.
//!
//!   COMPUTE (once per share, cheap): seed the 8-limb state from
//!     SHA-256(header || nonce) and the epoch seed, then run N_ITERATIONS
//!     rounds of data-dependent dataset reads mixed with XOR/add/rotate,
//!     a SHA-256 compression every 8th round and a Blake3 compression every
//!     16th round. The dataset is shared between connections and is never
//!     written during verification.
//!
//!   mix_hash = SHA-256(final state)
//!   result   = SHA-256(SHA-256(header_seed || mix_hash))
//!
//! Any engine with the same shape (seed, dataset, compute) can be plugged in
//! through `PowEngine`.

use sha2::{Digest, Sha256};

use crate::core::types::*;
use crate::error::PowError;

/// Size of each dataset chunk in bytes
pub const CHUNK_SIZE: usize = 64;

/// Number of mixing iterations per verification
const N_ITERATIONS: usize = 64;

/// Precomputed verification data for one epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct EpochDataset {
    pub epoch: u64,
    pub seed: Hash256,
    pub data: Vec<u8>,
}

impl EpochDataset {
    pub fn n_chunks(&self) -> usize {
        self.data.len() / CHUNK_SIZE
    }
}

impl std::fmt::Debug for EpochDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochDataset")
            .field("epoch", &self.epoch)
            .field("seed", &hex::encode(self.seed))
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowOutput {
    pub result: Hash256,
    pub mix_hash: Hash256,
}

/// Pluggable proof-of-work verification.
pub trait PowEngine: Send + Sync + 'static {
    /// Seed hash identifying an epoch.
    fn seed_hash(&self, epoch: u64) -> Hash256;

    /// Bytes in a generated dataset.
    fn dataset_size(&self) -> usize;

    /// Build the verification dataset for an epoch. CPU and memory heavy;
    /// callers run it on a blocking thread.
    fn generate(&self, epoch: u64) -> Result<EpochDataset, PowError>;

    /// Evaluate one (header, nonce) pair against a dataset.
    fn compute(
        &self,
        dataset: &EpochDataset,
        header_hash: &Hash256,
        nonce: u64,
    ) -> Result<PowOutput, PowError>;
}

/// Default memory-hard engine.
#[derive(Debug, Clone)]
pub struct ForgeHash {
    dataset_size: usize,
    threads: usize,
}

impl ForgeHash {
    /// `dataset_size` is rounded down to whole chunks.
    pub fn new(dataset_size: usize) -> Self {
        Self::with_threads(dataset_size, num_cpus::get().max(1))
    }

    pub fn with_threads(dataset_size: usize, threads: usize) -> Self {
        Self {
            dataset_size: dataset_size - dataset_size % CHUNK_SIZE,
            threads: threads.max(1),
        }
    }
}

/// Seed of epoch `e`: SHA-256 applied `e` times to the zero hash.
pub fn epoch_seed(epoch: u64) -> Hash256 {
    let mut seed = NULL_HASH;
    for _ in 0..epoch {
        let digest = Sha256::digest(seed);
        seed.copy_from_slice(&digest);
    }
    seed
}

fn fill_chunk(seed: &Hash256, index: usize, chunk: &mut [u8]) {
    let mut input = Vec::with_capacity(40);
    input.extend_from_slice(seed);
    input.extend_from_slice(&(index as u64).to_le_bytes());
    let first = blake3::hash(&input);
    chunk[..32].copy_from_slice(first.as_bytes());

    let mut input2 = Vec::with_capacity(40);
    input2.extend_from_slice(first.as_bytes());
    input2.extend_from_slice(&(index as u64).to_le_bytes());
    chunk[32..64].copy_from_slice(blake3::hash(&input2).as_bytes());
}

fn limb(bytes: &[u8], i: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
    u64::from_le_bytes(b)
}

fn state_bytes(state: &[u64; 8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    for j in 0..8 {
        out[j * 8..(j + 1) * 8].copy_from_slice(&state[j].to_le_bytes());
    }
    out
}

fn sha256(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

impl PowEngine for ForgeHash {
    fn seed_hash(&self, epoch: u64) -> Hash256 {
        epoch_seed(epoch)
    }

    fn dataset_size(&self) -> usize {
        self.dataset_size
    }

    fn generate(&self, epoch: u64) -> Result<EpochDataset, PowError> {
        if self.dataset_size == 0 {
            return Err(PowError::EmptyDataset);
        }
        let seed = epoch_seed(epoch);
        let mut data = vec![0u8; self.dataset_size];

        let n_chunks = self.dataset_size / CHUNK_SIZE;
        let chunks_per_thread = n_chunks.div_ceil(self.threads);
        let slice_len = chunks_per_thread * CHUNK_SIZE;

        std::thread::scope(|scope| {
            for (t, slice) in data.chunks_mut(slice_len).enumerate() {
                let seed = &seed;
                scope.spawn(move || {
                    let base = t * chunks_per_thread;
                    for (i, chunk) in slice.chunks_mut(CHUNK_SIZE).enumerate() {
                        fill_chunk(seed, base + i, chunk);
                    }
                });
            }
        });

        Ok(EpochDataset { epoch, seed, data })
    }

    fn compute(
        &self,
        dataset: &EpochDataset,
        header_hash: &Hash256,
        nonce: u64,
    ) -> Result<PowOutput, PowError> {
        let n_chunks = dataset.n_chunks();
        if n_chunks == 0 {
            return Err(PowError::EmptyDataset);
        }

        let header_seed = sha256(&[header_hash, &nonce.to_be_bytes()]);

        let mut state = [0u64; 8];
        for i in 0..4 {
            state[i] = limb(&header_seed, i);
            state[4 + i] = limb(&dataset.seed, i);
        }

        for round in 0..N_ITERATIONS {
            // Data-dependent read
            let read_idx = (state[0].wrapping_add(state[round % 8]) % n_chunks as u64) as usize;
            let offset = read_idx * CHUNK_SIZE;
            let chunk = &dataset.data[offset..offset + CHUNK_SIZE];

            for j in 0..8 {
                state[j] ^= limb(chunk, j);
                state[j] = state[j]
                    .wrapping_add(state[(j + 1) % 8])
                    .rotate_left((round as u32 + j as u32) % 64);
            }

            if round % 8 == 7 {
                let digest = sha256(&[&state_bytes(&state)]);
                for j in 0..4 {
                    state[j] ^= limb(&digest, j);
                }
            }

            if round % 16 == 15 {
                let digest = blake3::hash(&state_bytes(&state));
                for j in 0..4 {
                    state[4 + j] ^= limb(digest.as_bytes(), j);
                }
            }
        }

        let mix_hash = sha256(&[&state_bytes(&state)]);
        let first = sha256(&[&header_seed, &mix_hash]);
        let result = sha256(&[&first]);
        Ok(PowOutput { result, mix_hash })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Small ForgeHash that counts generations, can be slowed down, and can
    /// be told to fail its first N generations.
    pub(crate) struct CountingEngine {
        inner: ForgeHash,
        pub(crate) generations: AtomicUsize,
        delay: Duration,
        failures_left: AtomicUsize,
    }

    impl CountingEngine {
        pub(crate) fn new(delay: Duration) -> Self {
            Self::failing(delay, 0)
        }

        pub(crate) fn failing(delay: Duration, failures: usize) -> Self {
            Self {
                inner: ForgeHash::with_threads(4096, 1),
                generations: AtomicUsize::new(0),
                delay,
                failures_left: AtomicUsize::new(failures),
            }
        }

        pub(crate) fn count(&self) -> usize {
            self.generations.load(Ordering::SeqCst)
        }
    }

    impl PowEngine for CountingEngine {
        fn seed_hash(&self, epoch: u64) -> Hash256 {
            self.inner.seed_hash(epoch)
        }

        fn dataset_size(&self) -> usize {
            self.inner.dataset_size()
        }

        fn generate(&self, epoch: u64) -> Result<EpochDataset, PowError> {
            self.generations.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(PowError::Generation("injected failure".into()));
            }
            self.inner.generate(epoch)
        }

        fn compute(
            &self,
            dataset: &EpochDataset,
            header_hash: &Hash256,
            nonce: u64,
        ) -> Result<PowOutput, PowError> {
            self.inner.compute(dataset, header_hash, nonce)
        }
    }
}
