//! Append-only journal backing the archive
//!
//! One JSON record per line. Every append is synced to disk before it returns.
//! A final line without its newline is the remains of an interrupted append and
//! is cut off on open; any other unreadable line is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{ArchiveEntry, ArchiveError};

/// Byte sink the journal appends to
pub(crate) trait JournalStore: Write + Send + Sync {
    /// Make everything written so far durable
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the store back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl JournalStore for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

pub(crate) struct Journal {
    path: PathBuf,
    store: Box<dyn JournalStore>,
    /// Length of the valid, fully synced prefix
    len: u64,
}

impl Journal {
    /// Open or create the journal and return the records it holds
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<ArchiveEntry>), ArchiveError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let mut entries = Vec::new();
        let mut valid_len = 0usize;
        for (index, line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
            if line.last() != Some(&b'\n') {
                warn!(
                    "journal {}: discarding {} byte(s) of interrupted append",
                    path.display(),
                    line.len()
                );
                break;
            }

            let record = &line[..line.len() - 1];
            if !record.iter().all(u8::is_ascii_whitespace) {
                let entry: ArchiveEntry =
                    serde_json::from_slice(record).map_err(|source| ArchiveError::Journal {
                        line: index + 1,
                        source,
                    })?;
                entries.push(entry);
            }
            valid_len += line.len();
        }

        if valid_len < content.len() {
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        debug!(
            "journal {}: replayed {} record(s)",
            path.display(),
            entries.len()
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                store: Box::new(file),
                len: valid_len as u64,
            },
            entries,
        ))
    }

    /// Journal over an arbitrary store that already holds `len` valid bytes
    #[cfg(test)]
    pub(crate) fn with_store(path: &Path, store: Box<dyn JournalStore>, len: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            store,
            len,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk
    pub(crate) fn append(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let result = self
            .store
            .write_all(&line)
            .and_then(|_| self.store.sync());

        match result {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Keep later appends off a half-written line
                if let Err(trunc) = self.store.truncate(self.len) {
                    warn!(
                        "journal {}: could not roll back failed append: {}",
                        self.path.display(),
                        trunc
                    );
                }
                Err(ArchiveError::Io(e))
            }
        }
    }
}
