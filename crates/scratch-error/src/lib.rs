#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScratchError>;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No live block for this key: never written, recycled away, or every
    /// verification attempt failed. The stale index entry (if any) has been
    /// removed by the time this surfaces.
    #[error("missing block: realm {realm}, hash {hash_left:016x}{hash_right:016x}")]
    MissingBlock {
        realm: u32,
        hash_left: u64,
        hash_right: u64,
    },

    /// Recovered payload bytes do not hash to the stored header hash.
    #[error(
        "invalid hash in file {file} at offset {offset:#x}: \
         expected {expected_left:016x}{expected_right:016x}, \
         got {actual_left:016x}{actual_right:016x}"
    )]
    InvalidHash {
        file: u32,
        offset: u64,
        expected_left: u64,
        expected_right: u64,
        actual_left: u64,
        actual_right: u64,
    },

    /// Raised by the payload-parsing layer above this crate; handled like a
    /// missing block by `read`.
    #[error("payload checksum mismatch")]
    ChecksumFailed,

    /// The index free list is empty: 2^24 live blocks already.
    #[error("block index capacity exceeded")]
    CapacityExceeded,

    /// Three consecutive writers refused the block: it cannot fit in one file.
    #[error("block of {length} bytes does not fit in a single file")]
    WriteTooLarge { length: u64 },

    /// An address was dispatched to the wrong block file. Programming bug.
    #[error("address names file {actual_file}, handled by file {expected_file}")]
    InvalidAddress { expected_file: u32, actual_file: u32 },

    #[error("invalid configuration: {0}")]
    Format(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(ScratchError::Io(_))));
    }

    #[test]
    fn display_includes_key_context() {
        let err = ScratchError::MissingBlock {
            realm: 12,
            hash_left: 1,
            hash_right: 2,
        };
        let text = err.to_string();
        assert!(text.contains("realm 12"));
        assert!(text.contains("0000000000000001"));
    }
}
