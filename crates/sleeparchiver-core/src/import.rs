//! Import Pipeline
//!
//! Drives one full device sync: identify the device, list its sessions, then
//! fetch, decode and archive them one at a time.
//!
//! Failure policy:
//! - a session whose block is damaged after the engine's retry, rejected by the
//!   device or malformed is skipped and recorded in the summary
//! - a lost connection aborts the run after one reconnect attempt
//! - an archive write failure aborts the run
//! - cancellation stops before the next fetch and closes the port; everything
//!   archived so far stays archived

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::archive::{ArchiveError, IngestOutcome, SharedArchive};
use crate::protocol::{DeviceInfo, ProtocolDescription, ProtocolEngine, ProtocolError, SessionHandle};
use crate::session::decode;
use crate::transport::{Transport, TransportError};

/// Receives progress updates during an import
pub trait ProgressSink {
    /// Called after each listed session has been handled
    fn on_progress(&self, fetched: usize, total: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize),
{
    fn on_progress(&self, fetched: usize, total: usize) {
        self(fetched, total)
    }
}

/// A session that was listed but not archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSession {
    pub handle: SessionHandle,
    pub reason: String,
}

/// Outcome of an import run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// What the device reported; `None` if the run ended before identify
    pub device: Option<DeviceInfo>,
    /// Sessions listed by the device
    pub total: usize,
    /// Blocks received intact
    pub fetched: usize,
    pub inserted: usize,
    pub duplicate: usize,
    pub skipped: Vec<SkippedSession>,
}

/// Errors that end an import run
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Connection lost: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol failure: {0}")]
    Protocol(ProtocolError),

    #[error("Archive write failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Import cancelled after {} of {} session(s)", .partial.fetched, .partial.total)]
    Cancelled { partial: Box<ImportSummary> },

    #[error("Another import is already running on this archive")]
    AlreadyRunning,

    #[error("Import task failed: {0}")]
    Task(String),
}

impl From<ProtocolError> for ImportError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Transport(t) => ImportError::Transport(t),
            other => ImportError::Protocol(other),
        }
    }
}

/// Configured import run against one archive
#[derive(Clone)]
pub struct ImportPipeline {
    archive: SharedArchive,
    description: ProtocolDescription,
    capture_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl ImportPipeline {
    pub fn new(archive: SharedArchive, description: ProtocolDescription) -> Self {
        Self {
            archive,
            description,
            capture_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Save every fetched block under `dir` as a raw capture
    pub fn with_capture_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.capture_dir = dir;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this pipeline's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a full sync over `transport` on the calling thread.
    ///
    /// Fails with [`ImportError::AlreadyRunning`] if another run holds the
    /// archive.
    pub fn run(
        &self,
        transport: &mut Transport,
        progress: &dyn ProgressSink,
    ) -> Result<ImportSummary, ImportError> {
        let _guard = self
            .archive
            .try_begin_import()
            .ok_or(ImportError::AlreadyRunning)?;
        self.run_claimed(transport, progress)
    }

    fn run_claimed(
        &self,
        transport: &mut Transport,
        progress: &dyn ProgressSink,
    ) -> Result<ImportSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id, port = %transport.port_name());
        let _enter = span.enter();

        let result = self.sync(transport, progress);
        match &result {
            Ok(summary) => info!(
                "import finished: {} listed, {} new, {} duplicate, {} skipped",
                summary.total,
                summary.inserted,
                summary.duplicate,
                summary.skipped.len()
            ),
            Err(ImportError::Cancelled { partial }) => {
                transport.close();
                info!(
                    "import cancelled: {} of {} fetched, {} new",
                    partial.fetched, partial.total, partial.inserted
                );
            }
            Err(e) => warn!("import failed: {}", e),
        }
        result
    }

    fn sync(
        &self,
        transport: &mut Transport,
        progress: &dyn ProgressSink,
    ) -> Result<ImportSummary, ImportError> {
        let mut summary = ImportSummary::default();
        let mut reconnected = false;

        self.check_cancelled(&summary)?;
        let device = self.engine(transport)?.identify().map_err(|e| self.abort(e, &summary))?;
        summary.device = Some(device);

        self.check_cancelled(&summary)?;
        let handles = self
            .engine(transport)?
            .list_session_handles()
            .map_err(|e| self.abort(e, &summary))?;
        summary.total = handles.len();
        if handles.len() != device.stored_sessions as usize {
            debug!(
                "device reported {} stored session(s) but listed {}",
                device.stored_sessions,
                handles.len()
            );
        }

        let mut index = 0;
        while index < handles.len() {
            let handle = handles[index];
            self.check_cancelled(&summary)?;

            let fetched = self.engine(transport)?.fetch_session(handle);
            let block = match fetched {
                Ok(block) => block,
                Err(ProtocolError::Transport(TransportError::Cancelled)) => {
                    return Err(cancelled(&summary));
                }
                Err(ProtocolError::Transport(e)) => {
                    if reconnected {
                        return Err(ImportError::Transport(e));
                    }
                    warn!("lost connection while fetching {}: {}", handle, e);
                    reconnected = true;
                    if let Err(re) = transport.reconnect() {
                        debug!("reconnect failed: {}", re);
                        return Err(ImportError::Transport(e));
                    }
                    continue;
                }
                // Configuration faults would fail every handle the same way
                Err(
                    e @ (ProtocolError::InvalidDescription(_)
                    | ProtocolError::RequestLength { .. }),
                ) => {
                    return Err(ImportError::Protocol(e));
                }
                Err(e) => {
                    warn!("skipping session {}: {}", handle, e);
                    summary.skipped.push(SkippedSession {
                        handle,
                        reason: e.to_string(),
                    });
                    index += 1;
                    progress.on_progress(index, summary.total);
                    continue;
                }
            };
            summary.fetched += 1;

            if let Some(dir) = &self.capture_dir {
                write_capture(dir, device.serial, handle, &block);
            }

            match decode(&block) {
                Ok(session) => match self.archive.ingest(session)? {
                    IngestOutcome::Inserted => summary.inserted += 1,
                    IngestOutcome::Duplicate => summary.duplicate += 1,
                },
                Err(e) => {
                    warn!("skipping session {}: {}", handle, e);
                    summary.skipped.push(SkippedSession {
                        handle,
                        reason: e.to_string(),
                    });
                }
            }

            index += 1;
            progress.on_progress(index, summary.total);
        }

        Ok(summary)
    }

    fn engine<'t>(&self, transport: &'t mut Transport) -> Result<ProtocolEngine<'t>, ImportError> {
        ProtocolEngine::new(transport, self.description.clone()).map_err(ImportError::Protocol)
    }

    fn check_cancelled(&self, summary: &ImportSummary) -> Result<(), ImportError> {
        if self.cancel.is_cancelled() {
            return Err(cancelled(summary));
        }
        Ok(())
    }

    fn abort(&self, e: ProtocolError, summary: &ImportSummary) -> ImportError {
        match e {
            ProtocolError::Transport(TransportError::Cancelled) => cancelled(summary),
            other => other.into(),
        }
    }
}

fn cancelled(summary: &ImportSummary) -> ImportError {
    ImportError::Cancelled {
        partial: Box::new(summary.clone()),
    }
}

/// Raw capture path for one fetched block
pub fn capture_path(dir: &Path, device_serial: u32, handle: SessionHandle) -> PathBuf {
    dir.join(format!("session_{}_{}.bin", device_serial, handle.0))
}

fn write_capture(dir: &Path, device_serial: u32, handle: SessionHandle, block: &[u8]) {
    let path = capture_path(dir, device_serial, handle);
    let result = fs::create_dir_all(dir).and_then(|_| fs::write(&path, block));
    match result {
        Ok(()) => debug!("captured {} to {}", handle, path.display()),
        Err(e) => warn!("could not write capture {}: {}", path.display(), e),
    }
}

/// Run `pipeline` on a blocking worker thread.
///
/// The archive is claimed before the task starts, so a second call while one
/// is running fails immediately with [`ImportError::AlreadyRunning`]. The
/// transport is moved into the task and observes the pipeline's cancellation
/// token; it is closed when the task ends.
pub fn spawn_import<P>(
    pipeline: ImportPipeline,
    transport: Transport,
    progress: P,
) -> Result<JoinHandle<Result<ImportSummary, ImportError>>, ImportError>
where
    P: ProgressSink + Send + 'static,
{
    let guard = pipeline
        .archive
        .try_begin_import()
        .ok_or(ImportError::AlreadyRunning)?;
    let mut transport = transport.with_cancellation(pipeline.cancellation_token());

    Ok(tokio::task::spawn_blocking(move || {
        let _guard = guard;
        pipeline.run_claimed(&mut transport, &progress)
    }))
}

/// Await a spawned import and flatten task failures into [`ImportError`]
pub async fn join_import(
    handle: JoinHandle<Result<ImportSummary, ImportError>>,
) -> Result<ImportSummary, ImportError> {
    handle
        .await
        .map_err(|e| ImportError::Task(e.to_string()))?
}
