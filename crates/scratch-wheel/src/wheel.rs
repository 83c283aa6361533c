//! Round-robin ring of block files with one active writer.
//!
//! User threads schedule writes against the current writer and request its
//! recycling when it fills. A dedicated control thread keeps the current
//! writer's flush cursor close behind its write cursor, retires exhausted
//! writers (final flush on a detached thread), and replaces the oldest slot
//! with a fresh file — deferring the swap until outstanding pins drop.

use crate::block_file::BlockFile;
use crate::recycler::BackgroundRecycler;
use crate::source::FileSource;
use crate::writer::{FileWriter, WriteCallback};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use scratch_error::{Result, ScratchError};
use scratch_types::{BLOCK_ALIGNMENT, BlockAddress, FileId, Hash128};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Invoked for every block of a file about to be destroyed, strictly before
/// its memory goes away. The top layer wires this to the index removal.
pub type DeletionCallback = Box<dyn Fn(u32, Hash128, BlockAddress) + Send + Sync>;

/// Runtime knobs of the control thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelConfig {
    /// How long one control iteration waits for a recycle request when the
    /// current writer had nothing to flush.
    pub recycle_wait: Duration,
    /// Byte cap of one fast flush, keeping iterations short.
    pub fast_flush_limit: u64,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            recycle_wait: Duration::from_secs(1),
            fast_flush_limit: 2 * 1024 * 1024,
        }
    }
}

impl WheelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recycle_wait.is_zero() {
            return Err(ScratchError::Format(
                "recycle_wait must be > 0".to_owned(),
            ));
        }
        if self.fast_flush_limit < BLOCK_ALIGNMENT {
            return Err(ScratchError::Format(format!(
                "fast_flush_limit must be at least {BLOCK_ALIGNMENT}"
            )));
        }
        Ok(())
    }
}

struct WheelInner {
    source: FileSource,
    read_files: Box<[ArcSwapOption<BlockFile>]>,
    recycler: BackgroundRecycler<FileWriter>,
    /// Slot to recycle next. Only the control thread advances it.
    next_alloc: AtomicUsize,
    on_deletion: DeletionCallback,
    config: WheelConfig,
    files_recycled: AtomicU64,
    blocks_recovered: AtomicU64,
}

pub struct FileWheel {
    inner: Arc<WheelInner>,
    stop: Arc<AtomicBool>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl FileWheel {
    /// Scan the source, install recovered files, and ready the first two
    /// writers. Slots 0 and 1 always start fresh — whatever they held is
    /// discarded. The control thread is not running yet; call
    /// [`FileWheel::start`] after priming the index.
    pub fn new(source: FileSource, config: WheelConfig, on_deletion: DeletionCallback) -> Result<Self> {
        config.validate()?;
        let file_count = source.file_count();
        let inner = Arc::new(WheelInner {
            source,
            read_files: (0..file_count).map(|_| ArcSwapOption::const_empty()).collect(),
            recycler: BackgroundRecycler::new(),
            next_alloc: AtomicUsize::new(2),
            on_deletion,
            config,
            files_recycled: AtomicU64::new(0),
            blocks_recovered: AtomicU64::new(0),
        });

        for (index, mem) in inner.source.scan_existing_files()? {
            if index < 2 {
                // The first two slots back the first two writers; stale
                // content there is dropped, not recovered.
                continue;
            }
            let file_id = file_id_of_slot(index)?;
            let file = BlockFile::recover(Arc::new(mem), file_id);
            inner
                .blocks_recovered
                .fetch_add(u64::from(file.block_count()), Ordering::Relaxed);
            inner.read_files[index].store(Some(Arc::new(file)));
        }

        inner.replace_file(0)?;
        inner.replace_file(1)?;

        info!(
            target: "scratch::wheel",
            event = "wheel_ready",
            files = file_count,
            blocks_recovered = inner.blocks_recovered.load(Ordering::Relaxed),
        );
        Ok(Self {
            inner,
            stop: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        })
    }

    /// Spawn the control thread.
    pub fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name("scratch-wheel".to_owned())
            .spawn(move || control_loop(&inner, &stop))?;
        *self.control.lock() = Some(handle);
        Ok(())
    }

    /// Reserve space for a block, recycling exhausted writers along the
    /// way. Three refusals in a row mean the block cannot fit in any file.
    pub fn schedule_write(
        &self,
        realm: u32,
        hash: Hash128,
        length: usize,
        writer_cb: WriteCallback,
    ) -> Result<BlockAddress> {
        let mut callback = writer_cb;
        for _ in 0..3 {
            let writer = self.inner.recycler.get_current();
            match writer.try_schedule_write(realm, hash, length, callback) {
                Ok(addr) => return Ok(addr),
                Err(back) => {
                    callback = back;
                    self.inner.recycler.request_recycle(&writer);
                }
            }
        }
        Err(ScratchError::WriteTooLarge {
            length: length as u64,
        })
    }

    /// Dispatch a read to the block file the address names.
    ///
    /// `Ok(None)` when the address is none, its slot is empty (recycled),
    /// or the file rejects the read.
    pub fn try_with_block_at_address<T>(
        &self,
        addr: BlockAddress,
        realm: u32,
        hash: Hash128,
        reader: impl FnOnce(&[u8]) -> T,
    ) -> Result<Option<T>> {
        if addr.is_none() {
            return Ok(None);
        }
        let slot = addr.file() as usize - 1;
        if slot >= self.inner.read_files.len() {
            return Ok(None);
        }
        let Some(file) = self.inner.read_files[slot].load_full() else {
            return Ok(None);
        };
        file.try_with_block_at_address(addr, realm, hash, reader)
    }

    /// Visit every block recovered from disk, in file order. Used once at
    /// startup to prime the index, before the control thread runs.
    pub fn for_each_recovered(&self, mut visit: impl FnMut(u32, Hash128, BlockAddress)) {
        let start = self.inner.next_alloc.load(Ordering::Relaxed);
        for slot in start..self.inner.read_files.len() {
            if let Some(file) = self.inner.read_files[slot].load_full() {
                for (realm, hash, addr) in file.enumerate_blocks() {
                    visit(realm, hash, addr);
                }
            }
        }
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.inner.read_files.len()
    }

    #[must_use]
    pub fn files_recycled(&self) -> u64 {
        self.inner.files_recycled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn blocks_recovered(&self) -> u64 {
        self.inner.blocks_recovered.load(Ordering::Relaxed)
    }

    /// Stop the control thread, then flush what it left behind: queued
    /// retired writers and the current one.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.control.lock().take() {
            if handle.join().is_err() {
                error!(target: "scratch::wheel", event = "control_thread_panicked");
            }
        }
        while let Some(retired) = self.inner.recycler.try_next_to_be_recycled(Duration::ZERO) {
            retired.flush_and_close();
        }
        if let Some(current) = self.inner.recycler.peek_current() {
            current.flush(false);
        }
        info!(target: "scratch::wheel", event = "wheel_stopped");
    }
}

impl Drop for FileWheel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WheelInner {
    /// Tear down the block file in `slot` (if any), invalidating its blocks
    /// through `on_deletion`, then create a fresh file and publish its
    /// reader/writer pair.
    fn replace_file(&self, slot: usize) -> Result<()> {
        if let Some(old) = self.read_files[slot].swap(None) {
            let mut dropped = 0_u64;
            for (realm, hash, addr) in old.enumerate_blocks() {
                (self.on_deletion)(realm, hash, addr);
                dropped += 1;
            }
            self.files_recycled.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "scratch::wheel",
                event = "file_recycled",
                slot = slot,
                blocks_dropped = dropped,
            );
        }

        let mem = self.source.delete_and_create(slot)?;
        let file_id = file_id_of_slot(slot)?;
        let (reader, writer) =
            FileWriter::create_pair(mem, file_id, self.config.fast_flush_limit);
        self.read_files[slot].store(Some(reader));
        self.recycler.complete_recycle(Arc::new(writer));
        Ok(())
    }
}

fn file_id_of_slot(slot: usize) -> Result<FileId> {
    FileId::new(slot as u32 + 1).map_err(|err| ScratchError::Format(err.to_string()))
}

fn control_loop(inner: &Arc<WheelInner>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let flushed = inner
            .recycler
            .peek_current()
            .is_some_and(|writer| writer.flush(true));
        let wait = if flushed {
            Duration::ZERO
        } else {
            inner.config.recycle_wait
        };

        let Some(retired) = inner.recycler.try_next_to_be_recycled(wait) else {
            continue;
        };

        // The final flush can take tens of seconds on a full file; it runs
        // detached while the wheel moves on.
        let flusher = Arc::clone(&retired);
        let spawned = std::thread::Builder::new()
            .name("scratch-flush".to_owned())
            .spawn(move || flusher.flush_and_close());
        if let Err(err) = spawned {
            warn!(
                target: "scratch::wheel",
                event = "flush_thread_spawn_failed",
                error = %err,
            );
            retired.flush_and_close();
        }

        let len = inner.read_files.len();
        let slot = inner.next_alloc.load(Ordering::Relaxed);
        inner.next_alloc.store((slot + 1) % len, Ordering::Relaxed);

        if inner.read_files[slot].load().is_none() {
            if let Err(err) = inner.replace_file(slot) {
                error!(
                    target: "scratch::wheel",
                    event = "replace_file_failed",
                    slot = slot,
                    error = %err,
                );
            }
        } else if let Some(old) = inner.read_files[slot].load_full() {
            let deferred = Arc::clone(inner);
            old.request_removal(Box::new(move || {
                if let Err(err) = deferred.replace_file(slot) {
                    error!(
                        target: "scratch::wheel",
                        event = "replace_file_failed",
                        slot = slot,
                        error = %err,
                    );
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use scratch_types::{BlockHeader, HEADER_SIZE};
    use std::time::Instant;

    fn test_config() -> WheelConfig {
        WheelConfig {
            recycle_wait: Duration::from_millis(10),
            fast_flush_limit: 2 * 1024 * 1024,
        }
    }

    fn copy_of(payload: &'static [u8]) -> WriteCallback {
        Box::new(move |slice| slice.copy_from_slice(payload))
    }

    fn noop_deletion() -> DeletionCallback {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn config_validation() {
        assert!(WheelConfig::default().validate().is_ok());
        let bad = WheelConfig {
            recycle_wait: Duration::ZERO,
            ..WheelConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = WheelConfig {
            fast_flush_limit: 100,
            ..WheelConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(&[dir.path().to_path_buf()], 4, 65536).unwrap();
        let wheel = FileWheel::new(source, test_config(), noop_deletion()).unwrap();

        let hash = Hash128::of(b"Hello, world!");
        let addr = wheel
            .schedule_write(1337, hash, 13, copy_of(b"Hello, world!"))
            .unwrap();
        assert_eq!(addr.file(), 1);
        assert_eq!(addr.offset(), 0);

        let got = wheel
            .try_with_block_at_address(addr, 1337, hash, <[u8]>::to_vec)
            .unwrap();
        assert_eq!(got.as_deref(), Some(b"Hello, world!".as_slice()));

        // None address and recycled-slot dispatch answer "absent".
        let got = wheel
            .try_with_block_at_address(BlockAddress::NONE, 1337, hash, |_| ())
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn startup_scan_primes_recovered_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec![dir.path().to_path_buf()];

        // Plant a block in slot 2 (file id 3) directly on disk.
        let hash = {
            let source = FileSource::new(&folders, 4, 16384).unwrap();
            let mem = source.delete_and_create(2).unwrap();
            let payload = b"recovered block";
            let hash = Hash128::of(payload);
            let header = BlockHeader {
                hash,
                realm: 21,
                rank: 0,
                content_length: payload.len() as i32,
            };
            mem.write(0, &header.encode());
            mem.write(HEADER_SIZE, payload);
            hash
        };

        let source = FileSource::new(&folders, 4, 16384).unwrap();
        let wheel = FileWheel::new(source, test_config(), noop_deletion()).unwrap();
        assert_eq!(wheel.blocks_recovered(), 1);

        let recovered = PlMutex::new(Vec::new());
        wheel.for_each_recovered(|realm, hash, addr| {
            recovered.lock().push((realm, hash, addr));
        });
        let recovered = recovered.into_inner();
        assert_eq!(recovered.len(), 1);
        let (realm, got_hash, addr) = recovered[0];
        assert_eq!(realm, 21);
        assert_eq!(got_hash, hash);
        assert_eq!(addr.file(), 3);

        let got = wheel
            .try_with_block_at_address(addr, 21, hash, <[u8]>::to_vec)
            .unwrap();
        assert_eq!(got.as_deref(), Some(b"recovered block".as_slice()));
    }

    #[test]
    fn recycling_invalidates_oldest_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(&[dir.path().to_path_buf()], 3, 4096).unwrap();
        let deleted: Arc<PlMutex<Vec<(u32, Hash128)>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        let wheel = FileWheel::new(
            source,
            test_config(),
            Box::new(move |realm, hash, _| sink.lock().push((realm, hash))),
        )
        .unwrap();
        wheel.start().unwrap();

        // One block fills one 4096-byte file; each extra write forces a
        // recycle. Six writes must wrap the 3-slot ring and drop the
        // earliest blocks.
        let payloads: Vec<Vec<u8>> = (0..6_u8).map(|i| vec![i; 2000]).collect();
        for payload in &payloads {
            let owned = payload.clone();
            let hash = Hash128::of(payload);
            wheel
                .schedule_write(1, hash, owned.len(), Box::new(move |slice| {
                    slice.copy_from_slice(&owned);
                }))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while deleted.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!deleted.lock().is_empty(), "no block was ever invalidated");
        assert!(wheel.files_recycled() > 0);
        assert_eq!(deleted.lock()[0].1, Hash128::of(&payloads[0]));

        wheel.shutdown();
    }

    #[test]
    fn oversized_write_fails_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(&[dir.path().to_path_buf()], 3, 4096).unwrap();
        let wheel = FileWheel::new(source, test_config(), noop_deletion()).unwrap();
        wheel.start().unwrap();

        let result = wheel.schedule_write(1, Hash128::new(1, 2), 8000, copy_of(b""));
        assert!(matches!(
            result,
            Err(ScratchError::WriteTooLarge { length: 8000 })
        ));

        wheel.shutdown();
    }
}
