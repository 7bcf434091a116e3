//! Thread-safe archive handle

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Archive, ArchiveError, IngestOutcome};
use crate::session::Session;

/// Shared handle to one [`Archive`].
///
/// Ingests take the write lock; exports and scans take the read lock. Clones
/// refer to the same archive.
#[derive(Clone)]
pub struct SharedArchive {
    inner: Arc<RwLock<Archive>>,
    import_running: Arc<AtomicBool>,
}

impl SharedArchive {
    pub fn new(archive: Archive) -> Self {
        Self {
            inner: Arc::new(RwLock::new(archive)),
            import_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read access. A writer that panicked cannot leave a half-applied entry,
    /// so a poisoned lock is taken over as is.
    pub fn read(&self) -> RwLockReadGuard<'_, Archive> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Archive> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, session: Session) -> Result<IngestOutcome, ArchiveError> {
        self.write().ingest(session)
    }

    pub fn export_csv(&self, destination: impl AsRef<Path>) -> Result<(), ArchiveError> {
        self.read().export_csv(destination)
    }

    pub fn export_xml(&self, destination: impl AsRef<Path>) -> Result<(), ArchiveError> {
        self.read().export_xml(destination)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Claim the archive for an import run. Returns `None` while another run
    /// holds it; the claim is released when the guard drops.
    pub fn try_begin_import(&self) -> Option<ImportGuard> {
        self.import_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ImportGuard {
                flag: Arc::clone(&self.import_running),
            })
    }

    pub fn import_running(&self) -> bool {
        self.import_running.load(Ordering::SeqCst)
    }
}

/// Exclusive import claim on a [`SharedArchive`]
#[derive(Debug)]
pub struct ImportGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ImportGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
