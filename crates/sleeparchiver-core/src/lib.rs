//! # SleepArchiver Core Library
//!
//! Reads recorded sleep sessions off an actigraphy wristwatch over its serial
//! docking cable and keeps them in a durable, deduplicated archive.
//!
//! This library provides:
//! - Serial port discovery, probing and bounded-timeout I/O
//! - The device's framed request/response protocol
//! - Decoding of raw session blocks into typed sessions
//! - A journal-backed session archive with CSV and XML export
//! - The import pipeline tying these together
//!
//! ## Example
//!
//! ```rust,ignore
//! use sleeparchiver_core::prelude::*;
//!
//! let config = ArchiverConfig::load_or_default(None)?;
//! let archive = SharedArchive::new(Archive::open(config.archive.resolve_path()?)?);
//!
//! let opener = Arc::new(SerialPortOpener::new(config.serial.baud_rate, config.serial.poll_timeout()));
//! let candidates = candidate_ports(config.serial.port.as_deref());
//! let mut transport = Transport::open(opener, &candidates, config.serial.transport_config())?;
//!
//! let summary = ImportPipeline::new(archive.clone(), config.protocol.clone())
//!     .run(&mut transport, &|done, total| println!("{}/{}", done, total))?;
//! println!("{} new sessions", summary.inserted);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod archive;
pub mod config;
pub mod import;
pub mod protocol;
pub mod session;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archive::{Archive, ArchiveEntry, IngestOutcome, IngestReport, SharedArchive};
    pub use crate::config::ArchiverConfig;
    pub use crate::import::{spawn_import, ImportError, ImportPipeline, ImportSummary, ProgressSink};
    pub use crate::protocol::{DeviceInfo, ProtocolDescription, ProtocolEngine, SessionHandle};
    pub use crate::session::{decode, Epoch, Sample, SampleKind, Session, SessionId};
    pub use crate::transport::{candidate_ports, SerialPortOpener, Transport, TransportConfig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
