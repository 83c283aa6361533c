#![deny(unsafe_code)]
//! The file wheel: a round-robin ring of memory-mapped append-only files.
//!
//! One writer is active at a time; exhausted writers are exchanged for fresh
//! ones by a background control thread that also keeps the flush cursor
//! close behind the write cursor. Block payloads are copied lazily — on the
//! first read or during a flush, whichever wins — through a one-shot read
//! flag per block. Readers pin a file while touching it; recycling a file
//! waits for its pin count to reach zero.
//!
//! `mem` is the only module in the workspace that uses `unsafe` (raw-parts
//! slices over a fixed-length mapping); everything else forbids it.

pub mod append;
pub mod block_file;
pub mod flag;
pub mod mem;
pub mod pin;
pub mod recycler;
pub mod source;
pub mod wheel;
pub mod writer;

pub use block_file::BlockFile;
pub use flag::{BlockFault, ReadFlag};
pub use mem::FileMemory;
pub use pin::Pinner;
pub use source::FileSource;
pub use wheel::{DeletionCallback, FileWheel, WheelConfig};
pub use writer::{FileWriter, WriteCallback};
