#![allow(unsafe_code)]
//! Fixed-length writable byte region backing one wheel file.
//!
//! The mapping is created read-write over the whole file and never moves or
//! resizes, so raw-parts slices over it stay valid for the lifetime of the
//! `FileMemory`. Concurrent access follows the wheel's protocol:
//!
//! - a payload region is written by exactly one thread (the block's read
//!   flag runs its copy action at most once), and no reader sees the region
//!   before that flag resolves;
//! - header bytes are written once by the scheduling thread and only read
//!   through addresses published after the write;
//! - teardown waits for the pin count to reach zero, so no slice outlives
//!   the mapping.

use memmap2::{MmapOptions, MmapRaw};
use scratch_error::{Result, ScratchError};
use std::fs::File;
use tracing::trace;

pub struct FileMemory {
    map: MmapRaw,
    len: u64,
    // Held so the descriptor outlives the mapping; all I/O goes through it.
    _file: File,
}

impl std::fmt::Debug for FileMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMemory").field("len", &self.len).finish()
    }
}

impl FileMemory {
    /// Map `len` bytes of `file` read-write. The file must already have
    /// exactly that length.
    pub fn map(file: File, len: u64) -> Result<Self> {
        let byte_len = usize::try_from(len).map_err(|_| {
            ScratchError::Format(format!("file of {len} bytes does not fit the address space"))
        })?;
        // SAFETY: the file stays open (and owned) for the mapping's whole
        // lifetime, and the wheel never truncates a mapped file — recycling
        // tears the `FileMemory` down first.
        let map = unsafe { MmapOptions::new().len(byte_len).map_raw(&file) }?;
        trace!(target: "scratch::mem", event = "file_mapped", len = len);
        Ok(Self {
            map,
            len,
            _file: file,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared view of `[offset, offset + len)`.
    ///
    /// Panics on out-of-bounds ranges, like slice indexing would.
    #[must_use]
    pub fn read(&self, offset: u64, len: usize) -> &[u8] {
        self.check_range(offset, len);
        // SAFETY: range checked against the fixed mapping length; the
        // mapping lives as long as `self`, which the returned borrow ties us
        // to. Writers never touch a range a reader can hold (see module doc).
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset as usize), len) }
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) {
        self.check_range(offset, data.len());
        // SAFETY: range checked; the wheel protocol gives the caller
        // exclusive access to this range until it is published.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_mut_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    /// Hand the caller a mutable view of `[offset, offset + len)`.
    ///
    /// Used for the deferred payload copy: the block's read flag guarantees
    /// the closure runs at most once and no reader sees the range before it
    /// returns.
    pub fn with_mut<R>(&self, offset: u64, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.check_range(offset, len);
        // SAFETY: range checked; exclusivity per the wheel protocol — the
        // one-shot flag serializes the single writer of this range ahead of
        // every reader.
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset as usize), len) };
        f(slice)
    }

    /// Flush `[offset, offset + len)` to durable storage.
    pub fn flush_range(&self, offset: u64, len: u64) -> std::io::Result<()> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        self.check_range(offset, len);
        self.map.flush_range(offset as usize, len)
    }

    fn check_range(&self, offset: u64, len: usize) {
        let end = offset.checked_add(len as u64);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "range {offset}+{len} outside file memory of {} bytes",
            self.len
        );
    }
}
