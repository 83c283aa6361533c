//! Appends blocks into one wheel file.
//!
//! Space is reserved and the block's flag appended under a mutex; the
//! header is written outside it; the payload copy is deferred into the flag
//! and runs on first read or during a flush, whichever comes first.

use crate::append::AppendList;
use crate::block_file::BlockFile;
use crate::flag::ReadFlag;
use crate::mem::FileMemory;
use parking_lot::Mutex;
use scratch_types::{BLOCK_ALIGNMENT, BlockAddress, BlockHeader, FileId, HEADER_SIZE, Hash128, REALM_MASK, align_to_block};
use std::sync::Arc;
use tracing::{debug, warn};

pub type WriteCallback = Box<dyn FnOnce(&mut [u8]) + Send>;

struct WriteCursor {
    /// End of the reserved region; `file length` once the file is full.
    offset: u64,
    /// Everything below this has been flushed to durable storage.
    flush_offset: u64,
}

pub struct FileWriter {
    mem: Arc<FileMemory>,
    file_id: FileId,
    flags: Arc<AppendList<ReadFlag>>,
    cursor: Mutex<WriteCursor>,
    fast_flush_limit: u64,
}

impl FileWriter {
    /// Build the reader/writer pair over one fresh file. Both halves share
    /// the memory and the flag list; the reader observes appended blocks
    /// through the list's publication ordering.
    #[must_use]
    pub fn create_pair(
        mem: FileMemory,
        file_id: FileId,
        fast_flush_limit: u64,
    ) -> (Arc<BlockFile>, FileWriter) {
        let mem = Arc::new(mem);
        let flags = Arc::new(AppendList::with_capacity(
            (mem.len() / BLOCK_ALIGNMENT) as usize,
        ));
        let reader = Arc::new(BlockFile::shared(
            Arc::clone(&mem),
            file_id,
            Arc::clone(&flags),
        ));
        let writer = FileWriter {
            mem,
            file_id,
            flags,
            cursor: Mutex::new(WriteCursor {
                offset: 0,
                flush_offset: 0,
            }),
            fast_flush_limit,
        };
        (reader, writer)
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Reserve space for a block and publish its header.
    ///
    /// Returns the block's address, or gives `writer_cb` back when the file
    /// cannot hold the block — the file is then marked full so subsequent
    /// attempts fail fast and the caller recycles this writer.
    pub fn try_schedule_write(
        &self,
        realm: u32,
        hash: Hash128,
        length: usize,
        writer_cb: WriteCallback,
    ) -> std::result::Result<BlockAddress, WriteCallback> {
        let padded = align_to_block(HEADER_SIZE + length as u64);

        let start;
        let rank;
        {
            let mut cursor = self.cursor.lock();
            start = cursor.offset;
            let Some(new_offset) = start.checked_add(padded) else {
                cursor.offset = self.mem.len();
                return Err(writer_cb);
            };
            if new_offset > self.mem.len() {
                // Full: stop trying, even if a smaller block would still fit.
                cursor.offset = self.mem.len();
                return Err(writer_cb);
            }
            cursor.offset = new_offset;

            rank = self.flags.count();
            let copy_mem = Arc::clone(&self.mem);
            let payload_offset = start + HEADER_SIZE;
            self.flags.push(ReadFlag::new_pending(Box::new(move || {
                copy_mem.with_mut(payload_offset, length, writer_cb);
                Ok(())
            })));
        }

        let header = BlockHeader {
            hash,
            realm: realm & REALM_MASK,
            rank: rank as i32,
            content_length: length as i32,
        };
        self.mem.write(start, &header.encode());

        let addr = BlockAddress::new(self.file_id, start)
            .expect("reserved offsets stay within the address packing");
        debug!(
            target: "scratch::writer",
            event = "block_scheduled",
            file = self.file_id.get(),
            offset = start,
            length = length,
        );
        Ok(addr)
    }

    /// Materialize pending payloads and push the flush cursor forward.
    ///
    /// Returns false when there is nothing to flush. A `fast` flush caps
    /// the flushed range so the control thread never stalls long behind one
    /// writer. Flush I/O errors are logged and swallowed: the data is still
    /// readable from memory and a later flush retries the file tail.
    pub fn flush(&self, fast: bool) -> bool {
        let (count, offset, flush_offset) = {
            let cursor = self.cursor.lock();
            (self.flags.count(), cursor.offset, cursor.flush_offset)
        };
        if flush_offset >= offset {
            return false;
        }

        for rank in 0..count {
            if let Some(flag) = self.flags.get(rank) {
                if let Err(fault) = flag.wait_until_readable() {
                    // Re-raises on reader access; nothing to do here.
                    warn!(
                        target: "scratch::writer",
                        event = "flush_skipped_bad_block",
                        file = self.file_id.get(),
                        rank = rank,
                        fault = %fault,
                    );
                }
            }
        }

        let mut todo = offset - flush_offset;
        if fast {
            todo = todo.min(self.fast_flush_limit);
        }
        if let Err(err) = self.mem.flush_range(flush_offset, todo) {
            warn!(
                target: "scratch::writer",
                event = "flush_failed",
                file = self.file_id.get(),
                offset = flush_offset,
                len = todo,
                error = %err,
            );
        }

        self.cursor.lock().flush_offset = flush_offset + todo;
        true
    }

    /// Refuse further writes and flush everything that was scheduled.
    pub fn flush_and_close(&self) {
        self.cursor.lock().offset = self.mem.len();
        self.flush(false);
        debug!(
            target: "scratch::writer",
            event = "writer_closed",
            file = self.file_id.get(),
            blocks = self.flags.count(),
        );
    }
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cursor = self.cursor.lock();
        f.debug_struct("FileWriter")
            .field("file_id", &self.file_id)
            .field("offset", &cursor.offset)
            .field("flush_offset", &cursor.flush_offset)
            .finish()
    }
}
