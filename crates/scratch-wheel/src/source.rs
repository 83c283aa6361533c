//! Owns the wheel's files on disk: `N` files of identical length, striped
//! round-robin across one or more folders.
//!
//! Global file index `i` lives in folder `i % folders` under the name
//! `{i / folders:04}.bin`. A scan deletes any file whose length does not
//! match the configured size; recycling deletes and recreates one file.

use crate::mem::FileMemory;
use scratch_error::{Result, ScratchError};
use scratch_types::{BLOCK_ALIGNMENT, MAX_FILE_COUNT, MAX_FILE_SIZE, MIN_FILE_SIZE};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct FileSource {
    folders: Vec<PathBuf>,
    file_count: usize,
    file_size: u64,
}

impl FileSource {
    pub fn new(folders: &[PathBuf], files_per_folder: usize, file_size: u64) -> Result<Self> {
        if folders.is_empty() {
            return Err(ScratchError::Format("at least one folder required".to_owned()));
        }
        let file_count = folders.len().saturating_mul(files_per_folder);
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
        if !(MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&file_size) {
            return Err(ScratchError::Format(format!(
                "file size must be in [{MIN_FILE_SIZE}, {MAX_FILE_SIZE}], got {file_size}"
            )));
        }
        if file_size % BLOCK_ALIGNMENT != 0 {
            return Err(ScratchError::Format(format!(
                "file size must be a multiple of {BLOCK_ALIGNMENT}, got {file_size}"
            )));
        }
        for folder in folders {
            std::fs::create_dir_all(folder)?;
        }
        Ok(Self {
            folders: folders.to_vec(),
            file_count,
            file_size,
        })
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn path_of(&self, index: usize) -> PathBuf {
        let folder = &self.folders[index % self.folders.len()];
        folder.join(format!("{:04}.bin", index / self.folders.len()))
    }

    /// Map every file already on disk with the right length; delete the
    /// rest. Returns (index, memory) pairs in index order.
    pub fn scan_existing_files(&self) -> Result<Vec<(usize, FileMemory)>> {
        let mut found = Vec::new();
        for index in 0..self.file_count {
            let path = self.path_of(index);
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            if metadata.len() != self.file_size {
                warn!(
                    target: "scratch::source",
                    event = "mismatched_file_deleted",
                    path = %path.display(),
                    actual_len = metadata.len(),
                    expected_len = self.file_size,
                );
                std::fs::remove_file(&path)?;
                continue;
            }
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            found.push((index, FileMemory::map(file, self.file_size)?));
        }
        info!(
            target: "scratch::source",
            event = "scan_complete",
            files_found = found.len(),
            files_total = self.file_count,
        );
        Ok(found)
    }

    /// Delete file `index` if present and create it anew, zero-filled, at
    /// the configured length.
    pub fn delete_and_create(&self, index: usize) -> Result<FileMemory> {
        let path = self.path_of(index);
        remove_if_present(&path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(self.file_size)?;
        debug!(
            target: "scratch::source",
            event = "file_created",
            index = index,
            path = %path.display(),
        );
        FileMemory::map(file, self.file_size)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
