//! Session Records
//!
//! Typed form of one recorded sleep session as stored on the device, plus the
//! decoder that produces it from a raw session block.
//!
//! A [`Session`] is immutable once built. Its [`SessionId`] (start, duration,
//! device serial) is what stays stable when the same physical recording is read
//! again, and is the key the archive deduplicates on.

mod builder;
mod decoder;

pub use builder::SessionBlockBuilder;
pub use decoder::{decode, MalformedFrame};

use decoder::check_header;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of the fixed session block header
pub const HEADER_LEN: usize = 16;

/// Maximum channels per epoch
pub const MAX_CHANNELS: usize = 4;

/// Highest valid channel value (movement intensity)
pub const MAX_SAMPLE_VALUE: u8 = 100;

/// Raw byte the device writes for a sample it did not record
pub const MISSING_SAMPLE: u8 = 0xFF;

/// One channel value of an epoch.
///
/// Holds the raw device byte, so every sample has exactly one textual and one
/// serialized form. Inspect it through [`Sample::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample(u8);

/// Classification of a [`Sample`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// In-range value
    Value(u8),
    /// Not recorded
    Missing,
    /// Recorded but outside the valid range; raw byte kept
    Invalid(u8),
}

impl Sample {
    pub const MISSING: Sample = Sample(MISSING_SAMPLE);

    pub fn from_raw(raw: u8) -> Self {
        Sample(raw)
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn kind(self) -> SampleKind {
        match self.0 {
            MISSING_SAMPLE => SampleKind::Missing,
            v if v <= MAX_SAMPLE_VALUE => SampleKind::Value(v),
            v => SampleKind::Invalid(v),
        }
    }

    /// The value, if it is valid
    pub fn value(self) -> Option<u8> {
        match self.kind() {
            SampleKind::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_missing(self) -> bool {
        self.0 == MISSING_SAMPLE
    }
}

impl From<u8> for Sample {
    fn from(raw: u8) -> Self {
        Sample::from_raw(raw)
    }
}

impl From<Sample> for u8 {
    fn from(sample: Sample) -> Self {
        sample.to_raw()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            SampleKind::Value(v) => write!(f, "{}", v),
            SampleKind::Missing => write!(f, "NA"),
            SampleKind::Invalid(v) => write!(f, "ERR:{}", v),
        }
    }
}

/// Failed to parse a sample from its textual form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid sample token '{0}'")]
pub struct ParseSampleError(pub String);

impl FromStr for Sample {
    type Err = ParseSampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSampleError(s.to_string());
        if s == "NA" {
            return Ok(Sample::MISSING);
        }
        let (raw, want_invalid) = match s.strip_prefix("ERR:") {
            Some(raw) => (raw, true),
            None => (s, false),
        };
        let sample = Sample::from_raw(raw.parse().map_err(|_| err())?);
        match sample.kind() {
            SampleKind::Invalid(_) if want_invalid => Ok(sample),
            SampleKind::Value(_) if !want_invalid => Ok(sample),
            _ => Err(err()),
        }
    }
}

/// One fixed-length time slice of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Seconds since session start
    pub offset_secs: u32,
    /// One sample per channel
    pub samples: Vec<Sample>,
}

/// Identity of a session, stable across re-reads of the same recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub start: DateTime<Utc>,
    pub duration_secs: u32,
    pub device_serial: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}s@{:08x}",
            format_timestamp(&self.start),
            self.duration_secs,
            self.device_serial
        )
    }
}

/// One recorded sleep session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    start: DateTime<Utc>,
    duration_secs: u32,
    device_serial: u32,
    epoch_secs: u8,
    channels: u8,
    epochs: Vec<Epoch>,
}

impl Session {
    pub fn new(
        start: DateTime<Utc>,
        duration_secs: u32,
        device_serial: u32,
        epoch_secs: u8,
        channels: u8,
        epochs: Vec<Epoch>,
    ) -> Self {
        Self {
            start,
            duration_secs,
            device_serial,
            epoch_secs,
            channels,
            epochs,
        }
    }

    pub fn id(&self) -> SessionId {
        SessionId {
            start: self.start,
            duration_secs: self.duration_secs,
            device_serial: self.device_serial,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    pub fn device_serial(&self) -> u32 {
        self.device_serial
    }

    /// Length of one epoch in seconds
    pub fn epoch_secs(&self) -> u8 {
        self.epoch_secs
    }

    /// Number of channels recorded per epoch
    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    /// Check everything [`decode`] guarantees about a session.
    ///
    /// Sessions read back from an export go through this before they reach
    /// the archive.
    pub fn validate(&self) -> Result<(), MalformedFrame> {
        if self.start.timestamp_subsec_nanos() != 0 {
            return Err(MalformedFrame::FractionalStart);
        }
        check_header(
            self.start.timestamp(),
            self.duration_secs,
            self.epoch_secs,
            self.channels,
        )?;
        if self.epochs.len() > u16::MAX as usize {
            return Err(MalformedFrame::TooManyEpochs(self.epochs.len()));
        }

        for (index, epoch) in self.epochs.iter().enumerate() {
            if epoch.samples.len() != self.channels as usize {
                return Err(MalformedFrame::EpochWidth {
                    index,
                    channels: self.channels,
                    actual: epoch.samples.len(),
                });
            }
            let expected = index as u64 * self.epoch_secs as u64;
            if epoch.offset_secs as u64 != expected {
                return Err(MalformedFrame::EpochOffset {
                    index,
                    expected,
                    actual: epoch.offset_secs,
                });
            }
        }
        Ok(())
    }
}

/// RFC 3339 timestamp with second precision and a `Z` suffix, as used by both
/// export formats
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a timestamp written by [`format_timestamp`] (any RFC 3339 offset accepted)
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}
