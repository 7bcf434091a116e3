//! Session Archive
//!
//! Append-only, deduplicated store of decoded sessions. Entries live in memory
//! in insertion order with a hash index on [`SessionId`]; the on-disk form is a
//! JSON-lines journal that is replayed on open.
//!
//! Guarantees:
//! - no two entries share a [`SessionId`]
//! - an ingest that returns [`IngestOutcome::Inserted`] is on disk
//! - exports are complete, deterministic and replace their destination
//!   atomically

mod csv;
pub(crate) mod journal;
mod shared;
mod xml;

pub use csv::{read_csv, write_csv};
pub use shared::{ImportGuard, SharedArchive};
pub use xml::{read_xml, write_xml, XML_FORMAT_VERSION};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionId};
use journal::Journal;

/// File name of the journal inside an archive directory
pub const JOURNAL_FILE_NAME: &str = "archive.jsonl";

/// Errors from archive storage and exports
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal record {line} is corrupt: {source}")]
    Journal {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid archive XML: {0}")]
    InvalidXml(String),

    #[error("Invalid archive CSV at line {line}: {reason}")]
    InvalidCsv { line: usize, reason: String },
}

/// A persisted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub session: Session,
    /// When the session entered the archive, second precision
    pub ingested_at: DateTime<Utc>,
}

/// Result of offering one session to the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
}

/// Counts from a batch ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicate: usize,
}

impl IngestReport {
    pub fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted => self.inserted += 1,
            IngestOutcome::Duplicate => self.duplicate += 1,
        }
    }
}

/// Deduplicated session store backed by a journal
pub struct Archive {
    journal: Journal,
    entries: Vec<ArchiveEntry>,
    index: HashMap<SessionId, usize>,
    backup_exports: bool,
}

impl Archive {
    /// Open or create the archive journal at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let (journal, records) = Journal::open(path)?;

        let mut archive = Self {
            journal,
            entries: Vec::with_capacity(records.len()),
            index: HashMap::with_capacity(records.len()),
            backup_exports: false,
        };

        for entry in records {
            let id = entry.session.id();
            if archive.index.contains_key(&id) {
                warn!("journal {}: skipping repeated record for {}", path.display(), id);
                continue;
            }
            archive.push_entry(entry);
        }

        info!(
            "Opened archive {} with {} session(s)",
            path.display(),
            archive.entries.len()
        );
        Ok(archive)
    }

    /// Archive over an already-open journal, without replay
    #[cfg(test)]
    pub(crate) fn from_journal(journal: Journal) -> Self {
        Self {
            journal,
            entries: Vec::new(),
            index: HashMap::new(),
            backup_exports: false,
        }
    }

    /// Keep a `.bak` copy of any export destination that gets replaced
    pub fn with_backup_exports(mut self, enabled: bool) -> Self {
        self.backup_exports = enabled;
        self
    }

    /// Path of the backing journal
    pub fn path(&self) -> &Path {
        self.journal.path()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn get(&self, id: &SessionId) -> Option<&ArchiveEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.index.contains_key(id)
    }

    /// Offer a session to the archive.
    ///
    /// A session whose id is already present is reported as a duplicate and
    /// nothing is written. Otherwise the entry is synced to the journal before
    /// it becomes visible in memory.
    pub fn ingest(&mut self, session: Session) -> Result<IngestOutcome, ArchiveError> {
        self.ingest_entry(ArchiveEntry {
            session,
            ingested_at: Utc::now().trunc_subsecs(0),
        })
    }

    /// Ingest sessions in order, stopping at the first write failure
    pub fn ingest_many<I>(&mut self, sessions: I) -> Result<IngestReport, ArchiveError>
    where
        I: IntoIterator<Item = Session>,
    {
        let mut report = IngestReport::default();
        for session in sessions {
            report.record(self.ingest(session)?);
        }
        Ok(report)
    }

    fn ingest_entry(&mut self, entry: ArchiveEntry) -> Result<IngestOutcome, ArchiveError> {
        let id = entry.session.id();
        if self.index.contains_key(&id) {
            debug!("Session {} already archived", id);
            return Ok(IngestOutcome::Duplicate);
        }

        self.journal.append(&entry)?;
        self.push_entry(entry);
        debug!("Archived session {}", id);
        Ok(IngestOutcome::Inserted)
    }

    fn push_entry(&mut self, entry: ArchiveEntry) {
        self.index.insert(entry.session.id(), self.entries.len());
        self.entries.push(entry);
    }

    /// Write every entry as CSV to `destination`
    pub fn export_csv(&self, destination: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let destination = destination.as_ref();
        self.replace_file(destination, |file| {
            write_csv(file, &self.entries).map_err(ArchiveError::from)
        })?;
        info!(
            "Exported {} session(s) to {}",
            self.entries.len(),
            destination.display()
        );
        Ok(())
    }

    /// Write every entry as XML to `destination`
    pub fn export_xml(&self, destination: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let destination = destination.as_ref();
        self.replace_file(destination, |file| write_xml(file, &self.entries))?;
        info!(
            "Exported {} session(s) to {}",
            self.entries.len(),
            destination.display()
        );
        Ok(())
    }

    /// Ingest the sessions of an XML export, keeping their original ingestion
    /// times
    pub fn import_xml(&mut self, source: impl AsRef<Path>) -> Result<IngestReport, ArchiveError> {
        let source = source.as_ref();
        let content = fs::read_to_string(source)?;
        let entries = read_xml(&content)?;

        let mut report = IngestReport::default();
        for entry in entries {
            report.record(self.ingest_entry(entry)?);
        }

        info!(
            "Imported {}: {} new, {} duplicate",
            source.display(),
            report.inserted,
            report.duplicate
        );
        Ok(report)
    }

    /// Ingest the sessions of a CSV export. CSV does not carry ingestion
    /// times, so new entries are stamped now.
    pub fn import_csv(&mut self, source: impl AsRef<Path>) -> Result<IngestReport, ArchiveError> {
        let source = source.as_ref();
        let content = fs::read_to_string(source)?;
        let report = self.ingest_many(read_csv(&content)?)?;

        info!(
            "Imported {}: {} new, {} duplicate",
            source.display(),
            report.inserted,
            report.duplicate
        );
        Ok(report)
    }

    /// Write `destination` through a uniquely named temporary file in the same
    /// directory and rename it into place
    fn replace_file<F>(&self, destination: &Path, write: F) -> Result<(), ArchiveError>
    where
        F: FnOnce(&mut BufWriter<NamedTempFile>) -> Result<(), ArchiveError>,
    {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Dropped on any error, which removes it
        let tmp = NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(tmp);
        write(&mut writer)?;
        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;

        if self.backup_exports && destination.exists() {
            let backup = backup_path(destination);
            fs::copy(destination, &backup)?;
            debug!("Backed up {} to {}", destination.display(), backup.display());
        }

        tmp.persist(destination).map_err(|e| e.error)?;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}
