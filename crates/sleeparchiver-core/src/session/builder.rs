//! Builder for raw session blocks
//!
//! Produces byte blocks in the device's layout. Used for fixtures and for
//! re-encoding a decoded session.

use byteorder::{ByteOrder, LittleEndian};

use super::{Session, HEADER_LEN};

/// Builder for constructing session blocks
#[derive(Debug, Clone)]
pub struct SessionBlockBuilder {
    start: u32,
    duration: u32,
    device_serial: u32,
    epoch_secs: u8,
    channels: u8,
    samples: Vec<u8>,
    epoch_count: u16,
}

impl SessionBlockBuilder {
    /// Start a block with 30-second, single-channel epochs
    pub fn new(start: u32, duration: u32, device_serial: u32) -> Self {
        Self {
            start,
            duration,
            device_serial,
            epoch_secs: 30,
            channels: 1,
            samples: Vec::new(),
            epoch_count: 0,
        }
    }

    /// Re-encode a decoded session
    pub fn from_session(session: &Session) -> Self {
        let mut builder = Self::new(
            session.start().timestamp() as u32,
            session.duration_secs(),
            session.device_serial(),
        )
        .epoch_secs(session.epoch_secs())
        .channels(session.channels());

        for epoch in session.epochs() {
            let raw: Vec<u8> = epoch.samples.iter().map(|s| s.to_raw()).collect();
            builder = builder.epoch(&raw);
        }
        builder
    }

    pub fn epoch_secs(mut self, secs: u8) -> Self {
        self.epoch_secs = secs;
        self
    }

    pub fn channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// Append one epoch of raw sample bytes
    pub fn epoch(mut self, raw: &[u8]) -> Self {
        self.samples.extend_from_slice(raw);
        self.epoch_count = self.epoch_count.wrapping_add(1);
        self
    }

    /// Append `count` identical epochs
    pub fn repeat_epoch(mut self, count: u16, raw: &[u8]) -> Self {
        for _ in 0..count {
            self = self.epoch(raw);
        }
        self
    }

    /// Build the block
    pub fn build(self) -> Vec<u8> {
        let mut block = vec![0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut block[0..4], self.start);
        LittleEndian::write_u32(&mut block[4..8], self.duration);
        LittleEndian::write_u32(&mut block[8..12], self.device_serial);
        LittleEndian::write_u16(&mut block[12..14], self.epoch_count);
        block[14] = self.epoch_secs;
        block[15] = self.channels;
        block.extend_from_slice(&self.samples);
        block
    }
}
