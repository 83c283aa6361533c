#![forbid(unsafe_code)]
//! Disk-backed content-addressed scratch cache.
//!
//! Blocks of bytes are identified by a (realm, hash) pair, spilled into a
//! ring of memory-mapped files, and discarded oldest-file-first when space
//! runs out. Everything written is write-once and survives a restart if its
//! file was neither recycled nor picked as one of the two fresh writer
//! files.
//!
//! ```no_run
//! use scratch::{Hash128, Scratch, ScratchConfig};
//!
//! let config = ScratchConfig::new(vec!["/tmp/scratch".into()], 4, 1 << 20);
//! let cache = Scratch::open(config)?;
//!
//! let payload = b"Hello, world!";
//! let hash = Hash128::of(payload);
//! cache.write(1337, hash, payload.len(), move |slice| {
//!     slice.copy_from_slice(payload);
//! })?;
//! let bytes = cache.read(1337, hash, <[u8]>::to_vec)?;
//! # assert_eq!(&bytes, payload);
//! # Ok::<(), scratch::ScratchError>(())
//! ```

use scratch_error::Result;
use scratch_index::{BlockIndex, INDEX_SLOT_BITS, MIN_INDEX_SLOT_BITS};
use scratch_types::{
    BLOCK_ALIGNMENT, MAX_CONTENT_LENGTH, MAX_FILE_COUNT, MAX_FILE_SIZE, MIN_FILE_SIZE, REALM_MASK,
};
use scratch_wheel::{FileSource, FileWheel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

pub use scratch_error::ScratchError;
pub use scratch_types::Hash128;
pub use scratch_wheel::WheelConfig;

/// Where and how large the cache's files are, plus background knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Folders the files stripe across, round-robin.
    pub folders: Vec<PathBuf>,
    pub files_per_folder: usize,
    /// Exact length of every file, a multiple of 4096.
    pub file_size: u64,
    /// Index size exponent: `2^bits` slots. 24 in production (~512 MiB);
    /// smaller values shrink the footprint for tests and tools.
    #[serde(default = "default_index_slot_bits")]
    pub index_slot_bits: u32,
    #[serde(default)]
    pub wheel: WheelConfig,
}

fn default_index_slot_bits() -> u32 {
    INDEX_SLOT_BITS
}

impl ScratchConfig {
    #[must_use]
    pub fn new(folders: Vec<PathBuf>, files_per_folder: usize, file_size: u64) -> Self {
        Self {
            folders,
            files_per_folder,
            file_size,
            index_slot_bits: INDEX_SLOT_BITS,
            wheel: WheelConfig::default(),
        }
    }

    /// Check every knob, including the wheel's, before anything is
    /// allocated or touched on disk.
    pub fn validate(&self) -> Result<()> {
        if self.folders.is_empty() {
            return Err(ScratchError::Format(
                "at least one folder required".to_owned(),
            ));
        }
        let file_count = self.folders.len().saturating_mul(self.files_per_folder);
        if file_count < 3 {
            return Err(ScratchError::Format(format!(
                "need at least 3 files, got {file_count}"
            )));
        }
        if file_count > MAX_FILE_COUNT as usize {
            return Err(ScratchError::Format(format!(
                "at most {MAX_FILE_COUNT} files supported, got {file_count}"
            )));
        }
        if !(MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&self.file_size) {
            return Err(ScratchError::Format(format!(
                "file size must be in [{MIN_FILE_SIZE}, {MAX_FILE_SIZE}], got {}",
                self.file_size
            )));
        }
        if self.file_size % BLOCK_ALIGNMENT != 0 {
            return Err(ScratchError::Format(format!(
                "file size must be a multiple of {BLOCK_ALIGNMENT}, got {}",
                self.file_size
            )));
        }
        if !(MIN_INDEX_SLOT_BITS..=INDEX_SLOT_BITS).contains(&self.index_slot_bits) {
            return Err(ScratchError::Format(format!(
                "index slot bits must be in {MIN_INDEX_SLOT_BITS}..={INDEX_SLOT_BITS}, got {}",
                self.index_slot_bits
            )));
        }
        self.wheel.validate()
    }
}

/// Monotonic operation counters, snapshot via [`Scratch::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchStats {
    pub writes: u64,
    pub reads: u64,
    pub read_misses: u64,
    pub files_recycled: u64,
    pub blocks_recovered: u64,
}

#[derive(Default)]
struct Counters {
    writes: AtomicU64,
    reads: AtomicU64,
    read_misses: AtomicU64,
}

/// The cache: a block index over a file wheel.
pub struct Scratch {
    index: Arc<BlockIndex>,
    wheel: FileWheel,
    counters: Counters,
    closed: AtomicBool,
}

impl Scratch {
    /// Open (or create) the cache under `config`.
    ///
    /// Scans the folders for files left by an earlier process, rebuilds the
    /// index from their blocks, then starts the background control thread.
    pub fn open(config: ScratchConfig) -> Result<Self> {
        config.validate()?;
        let source = FileSource::new(&config.folders, config.files_per_folder, config.file_size)?;
        let index = Arc::new(BlockIndex::with_slot_bits(config.index_slot_bits)?);

        let deletion_index = Arc::clone(&index);
        let wheel = FileWheel::new(
            source,
            config.wheel.clone(),
            Box::new(move |realm, hash, addr| deletion_index.remove(realm, hash, addr)),
        )?;

        let mut primed = 0_u64;
        wheel.for_each_recovered(|realm, hash, addr| {
            match index.add(realm, hash, addr) {
                Ok(_) => primed += 1,
                Err(err) => warn!(
                    target: "scratch::cache",
                    event = "prime_failed",
                    realm = realm,
                    hash = %hash,
                    error = %err,
                ),
            }
        });
        wheel.start()?;

        info!(
            target: "scratch::cache",
            event = "cache_opened",
            files = wheel.file_count(),
            blocks_primed = primed,
        );
        Ok(Self {
            index,
            wheel,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Store a block under (realm, hash).
    ///
    /// Space is reserved and the key registered immediately; the payload is
    /// produced by `writer` later — on the first read or during a background
    /// flush, possibly on another thread. Until `writer` runs, the caller
    /// must not mutate anything it reads. Writing a key twice replaces the
    /// indexed address; the old block stays on disk until its file recycles.
    pub fn write(
        &self,
        realm: u32,
        hash: Hash128,
        length: usize,
        writer: impl FnOnce(&mut [u8]) + Send + 'static,
    ) -> Result<()> {
        if length as u64 > MAX_CONTENT_LENGTH {
            return Err(ScratchError::WriteTooLarge {
                length: length as u64,
            });
        }
        let realm = realm & REALM_MASK;
        let addr = self.wheel.schedule_write(realm, hash, length, Box::new(writer))?;
        self.index.add(realm, hash, addr)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run `reader` over the block stored under (realm, hash).
    ///
    /// Fails with [`ScratchError::MissingBlock`] when the key is absent,
    /// the block's file was recycled, or verification failed — in each case
    /// the stale index entry is gone before the error returns.
    pub fn read<T>(
        &self,
        realm: u32,
        hash: Hash128,
        reader: impl FnOnce(&[u8]) -> T,
    ) -> Result<T> {
        let realm = realm & REALM_MASK;
        let mut reader = Some(reader);

        // One retry: the first miss may be a read that raced a recycle and
        // removed the stale entry; a fresh index lookup may find the key
        // re-added at a new address.
        for _ in 0..2 {
            let addr = self.index.get(realm, hash);
            if addr.is_none() {
                break;
            }
            let slot = &mut reader;
            let outcome = self.wheel.try_with_block_at_address(addr, realm, hash, |payload| {
                let reader = slot.take().expect("block reader runs at most once");
                reader(payload)
            })?;
            match outcome {
                Some(value) => {
                    self.counters.reads.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                None => self.index.remove(realm, hash, addr),
            }
        }

        self.counters.read_misses.fetch_add(1, Ordering::Relaxed);
        Err(ScratchError::MissingBlock {
            realm,
            hash_left: hash.left,
            hash_right: hash.right,
        })
    }

    /// Whether the index currently holds this key. Cheap: no verification,
    /// so a `true` can still turn into a missing-block read.
    #[must_use]
    pub fn contains(&self, realm: u32, hash: Hash128) -> bool {
        !self.index.get(realm & REALM_MASK, hash).is_none()
    }

    /// Drop this key from the index. The block's bytes stay on disk until
    /// its file is recycled.
    pub fn remove(&self, realm: u32, hash: Hash128) {
        let realm = realm & REALM_MASK;
        let addr = self.index.get(realm, hash);
        if !addr.is_none() {
            self.index.remove(realm, hash, addr);
        }
    }

    /// Number of live blocks in the index.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.index.count()
    }

    #[must_use]
    pub fn stats(&self) -> ScratchStats {
        ScratchStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            read_misses: self.counters.read_misses.load(Ordering::Relaxed),
            files_recycled: self.wheel.files_recycled(),
            blocks_recovered: self.wheel.blocks_recovered(),
        }
    }

    /// Stop the background thread and flush in-flight writes. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.wheel.shutdown();
            info!(target: "scratch::cache", event = "cache_closed");
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.close();
    }
}
