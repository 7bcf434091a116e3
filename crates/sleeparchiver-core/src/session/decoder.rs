//! Session block decoder
//!
//! Block layout (little-endian):
//! - 4 bytes: start timestamp, Unix seconds
//! - 4 bytes: duration, seconds
//! - 4 bytes: device serial
//! - 2 bytes: epoch count
//! - 1 byte: epoch length, seconds
//! - 1 byte: channel count
//! - epoch count x channel count bytes: samples, epoch-major

use byteorder::{ByteOrder, LittleEndian};
use chrono::DateTime;
use thiserror::Error;

use super::{Epoch, Sample, Session, HEADER_LEN, MAX_CHANNELS};

/// 2000-01-01T00:00:00Z
const MIN_START: i64 = 946_684_800;
/// 2100-01-01T00:00:00Z
const MAX_START: i64 = 4_102_444_800;
/// Longest recording the device can hold
const MAX_DURATION_SECS: u32 = 48 * 3600;

/// A session block that cannot be turned into a [`Session`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedFrame {
    #[error("Block of {len} bytes is shorter than the 16-byte header")]
    TooShort { len: usize },

    #[error("{epochs} epochs x {channels} channels need {expected} sample bytes, block has {actual}")]
    LengthMismatch {
        epochs: u16,
        channels: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Start timestamp {0} is outside 2000..2100")]
    StartOutOfRange(i64),

    #[error("Start timestamp has a fractional second")]
    FractionalStart,

    #[error("Duration of {0}s is not plausible")]
    DurationOutOfRange(u32),

    #[error("Epoch length is zero")]
    ZeroEpochLength,

    #[error("Channel count {0} is not in 1..=4")]
    ChannelCount(u8),

    #[error("{0} epochs exceed what one session block can hold")]
    TooManyEpochs(usize),

    #[error("Epoch {index} has {actual} sample(s), session has {channels} channel(s)")]
    EpochWidth {
        index: usize,
        channels: u8,
        actual: usize,
    },

    #[error("Epoch {index} starts at offset {actual}s, expected {expected}s")]
    EpochOffset {
        index: usize,
        expected: u64,
        actual: u32,
    },
}

/// Decode one raw session block.
///
/// Pure and deterministic: the same bytes always yield the same session, and a
/// block that fails any check never yields a partial one.
pub fn decode(block: &[u8]) -> Result<Session, MalformedFrame> {
    if block.len() < HEADER_LEN {
        return Err(MalformedFrame::TooShort { len: block.len() });
    }

    let start = LittleEndian::read_u32(&block[0..4]);
    let duration = LittleEndian::read_u32(&block[4..8]);
    let device_serial = LittleEndian::read_u32(&block[8..12]);
    let epoch_count = LittleEndian::read_u16(&block[12..14]);
    let epoch_secs = block[14];
    let channels = block[15];

    check_header(start as i64, duration, epoch_secs, channels)?;

    let samples = &block[HEADER_LEN..];
    let expected = epoch_count as usize * channels as usize;
    if samples.len() != expected {
        return Err(MalformedFrame::LengthMismatch {
            epochs: epoch_count,
            channels,
            expected,
            actual: samples.len(),
        });
    }

    let epochs = samples
        .chunks_exact(channels as usize)
        .enumerate()
        .map(|(i, raw)| Epoch {
            offset_secs: i as u32 * epoch_secs as u32,
            samples: raw.iter().copied().map(Sample::from_raw).collect(),
        })
        .collect();

    let start = DateTime::from_timestamp(start as i64, 0)
        .ok_or(MalformedFrame::StartOutOfRange(start as i64))?;

    Ok(Session::new(
        start,
        duration,
        device_serial,
        epoch_secs,
        channels,
        epochs,
    ))
}

/// Plausibility checks on the session header fields
pub(super) fn check_header(
    start: i64,
    duration: u32,
    epoch_secs: u8,
    channels: u8,
) -> Result<(), MalformedFrame> {
    if !(MIN_START..MAX_START).contains(&start) {
        return Err(MalformedFrame::StartOutOfRange(start));
    }
    if duration == 0 || duration > MAX_DURATION_SECS {
        return Err(MalformedFrame::DurationOutOfRange(duration));
    }
    if epoch_secs == 0 {
        return Err(MalformedFrame::ZeroEpochLength);
    }
    if channels == 0 || channels as usize > MAX_CHANNELS {
        return Err(MalformedFrame::ChannelCount(channels));
    }
    Ok(())
}
