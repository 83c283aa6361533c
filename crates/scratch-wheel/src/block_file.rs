//! Read access to one wheel file: recovery scan, pinned verified reads,
//! block enumeration.

use crate::append::AppendList;
use crate::flag::{BlockFault, ReadFlag};
use crate::mem::FileMemory;
use crate::pin::Pinner;
use parking_lot::Mutex;
use scratch_error::{Result, ScratchError};
use scratch_types::{BLOCK_ALIGNMENT, BlockAddress, BlockHeader, FileId, HEADER_SIZE, Hash128, REALM_MASK};
use std::sync::Arc;
use tracing::{debug, warn};

pub type RemovalCallback = Box<dyn FnOnce() + Send>;

pub struct BlockFile {
    mem: Arc<FileMemory>,
    file_id: FileId,
    flags: Arc<AppendList<ReadFlag>>,
    pinner: Pinner,
    removal: Mutex<Option<RemovalCallback>>,
}

impl BlockFile {
    /// Rediscover the blocks of an existing file.
    ///
    /// Walks headers from offset 0 and accepts each whose rank continues
    /// the sequence and whose payload fits the file; the first malformed
    /// header ends the walk (the rest of the file is undefined bytes).
    /// Every accepted block gets a pending flag that hashes the payload on
    /// first access and faults on mismatch.
    #[must_use]
    pub fn recover(mem: Arc<FileMemory>, file_id: FileId) -> Self {
        let flags = Arc::new(AppendList::with_capacity(
            (mem.len() / BLOCK_ALIGNMENT) as usize,
        ));

        let mut offset = 0_u64;
        while offset + HEADER_SIZE <= mem.len() {
            let Ok(header) = BlockHeader::parse(mem.read(offset, HEADER_SIZE as usize)) else {
                break;
            };
            if header.rank != flags.count() as i32
                || header.content_length < 0
                || offset + HEADER_SIZE + header.content_length as u64 > mem.len()
            {
                break;
            }

            let payload_offset = offset + HEADER_SIZE;
            let length = header.content_length as usize;
            let expected = header.hash;
            let verify_mem = Arc::clone(&mem);
            flags.push(ReadFlag::new_pending(Box::new(move || {
                let actual = Hash128::of(verify_mem.read(payload_offset, length));
                if actual == expected {
                    Ok(())
                } else {
                    Err(BlockFault::InvalidHash {
                        offset: payload_offset,
                        expected,
                        actual,
                    })
                }
            })));

            offset += header.padded_length();
        }

        debug!(
            target: "scratch::file",
            event = "file_recovered",
            file = file_id.get(),
            blocks = flags.count(),
        );
        Self {
            mem,
            file_id,
            flags,
            pinner: Pinner::new(),
            removal: Mutex::new(None),
        }
    }

    /// Reader half of a fresh file: shares the writer's flag list and
    /// observes appended blocks through it.
    #[must_use]
    pub fn shared(mem: Arc<FileMemory>, file_id: FileId, flags: Arc<AppendList<ReadFlag>>) -> Self {
        Self {
            mem,
            file_id,
            flags,
            pinner: Pinner::new(),
            removal: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.flags.count()
    }

    /// Lazy walk of every block currently known, in file order. Reads
    /// headers only — never triggers payload verification.
    pub fn enumerate_blocks(&self) -> BlockIter<'_> {
        BlockIter {
            file: self,
            offset: 0,
            remaining: self.flags.count(),
        }
    }

    /// Run `reader` over the payload of the block at `addr`, after pinning
    /// the file and verifying that the header matches the caller's key.
    ///
    /// `Ok(None)` covers every recoverable mismatch: the file is sealed for
    /// removal, the header disagrees with (realm, hash), or the block's
    /// flag reports a fault. An address naming a different file is a
    /// programming error.
    pub fn try_with_block_at_address<T>(
        &self,
        addr: BlockAddress,
        realm: u32,
        hash: Hash128,
        reader: impl FnOnce(&[u8]) -> T,
    ) -> Result<Option<T>> {
        if addr.file() != self.file_id.get() {
            return Err(ScratchError::InvalidAddress {
                expected_file: self.file_id.get(),
                actual_file: addr.file(),
            });
        }
        if !self.pinner.try_pin() {
            return Ok(None);
        }
        let _pin = PinGuard { file: self };

        let offset = addr.offset();
        if offset + HEADER_SIZE > self.mem.len() {
            return Ok(None);
        }
        let Ok(header) = BlockHeader::parse(self.mem.read(offset, HEADER_SIZE as usize)) else {
            return Ok(None);
        };
        if header.realm & REALM_MASK != realm & REALM_MASK
            || header.hash != hash
            || header.rank < 0
            || header.rank as u32 >= self.flags.count()
            || header.content_length < 0
            || offset + HEADER_SIZE + header.content_length as u64 > self.mem.len()
        {
            return Ok(None);
        }

        let Some(flag) = self.flags.get(header.rank as u32) else {
            return Ok(None);
        };
        if let Err(fault) = flag.wait_until_readable() {
            warn!(
                target: "scratch::file",
                event = "block_unreadable",
                file = self.file_id.get(),
                offset = offset,
                fault = %fault,
            );
            return Ok(None);
        }

        let payload = self
            .mem
            .read(offset + HEADER_SIZE, header.content_length as usize);
        Ok(Some(reader(payload)))
    }

    /// Arrange for `callback` to run once no pins remain, and refuse new
    /// pins from now on. The callback is stored before the seal so the
    /// unpinner that observes the seal also observes the callback.
    pub fn request_removal(&self, callback: RemovalCallback) {
        *self.removal.lock() = Some(callback);
        if self.pinner.seal() {
            self.run_removal();
        }
    }

    fn run_removal(&self) {
        let callback = self.removal.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("file_id", &self.file_id)
            .field("blocks", &self.flags.count())
            .finish()
    }
}

struct PinGuard<'a> {
    file: &'a BlockFile,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if self.file.pinner.unpin() {
            self.file.run_removal();
        }
    }
}

/// Iterator over (realm, hash, address) of a file's known blocks.
pub struct BlockIter<'a> {
    file: &'a BlockFile,
    offset: u64,
    remaining: u32,
}

impl Iterator for BlockIter<'_> {
    type Item = (u32, Hash128, BlockAddress);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset + HEADER_SIZE > self.file.mem.len() {
            return None;
        }
        let header = BlockHeader::parse(self.file.mem.read(self.offset, HEADER_SIZE as usize)).ok()?;
        let addr = BlockAddress::new(self.file.file_id, self.offset).ok()?;

        self.remaining -= 1;
        self.offset += header.padded_length();
        Some((header.realm & REALM_MASK, header.hash, addr))
    }
}
