//! Frame encoding/decoding
//!
//! Frame format (both directions):
//! - 1 byte: sync
//! - 1 byte: opcode
//! - 2 bytes: payload length (little-endian)
//! - N bytes: payload
//! - 1 or 4 bytes: checksum over opcode, length and payload (little-endian)

use byteorder::{ByteOrder, LittleEndian};

use super::{ChecksumKind, Command, ProtocolError};

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 4;

/// Parsed fixed header of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sync: u8,
    pub opcode: u8,
    pub length: u16,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            sync: bytes[0],
            opcode: bytes[1],
            length: LittleEndian::read_u16(&bytes[2..4]),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [self.sync, self.opcode, 0, 0];
        LittleEndian::write_u16(&mut bytes[2..4], self.length);
        bytes
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Encode the frame to raw bytes
    pub fn encode(&self, sync: u8, checksum: ChecksumKind) -> Vec<u8> {
        let header = FrameHeader {
            sync,
            opcode: self.opcode,
            length: self.payload.len() as u16,
        };

        let mut bytes =
            Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len() + checksum.width());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);

        let crc = checksum.compute(&bytes[1..]);
        checksum.append(crc, &mut bytes);
        bytes
    }

    /// Decode and verify one complete frame
    pub fn decode(
        data: &[u8],
        sync: u8,
        checksum: ChecksumKind,
        command: Command,
    ) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_LEN + checksum.width() {
            return Err(ProtocolError::InvalidResponse {
                command,
                reason: format!("frame of {} bytes is shorter than header", data.len()),
            });
        }

        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&data[..FRAME_HEADER_LEN]);
        let header = FrameHeader::parse(&header_bytes);
        if header.sync != sync {
            return Err(ProtocolError::BadSync {
                expected: sync,
                actual: header.sync,
            });
        }

        let body_end = FRAME_HEADER_LEN + header.length as usize;
        if data.len() != body_end + checksum.width() {
            return Err(ProtocolError::LengthOutOfRange {
                command,
                length: header.length as usize,
            });
        }

        verify_checksum(
            checksum,
            command,
            &data[1..body_end],
            &data[body_end..],
        )?;

        Ok(Self {
            opcode: header.opcode,
            payload: data[FRAME_HEADER_LEN..body_end].to_vec(),
        })
    }
}

/// Check `covered` against the received checksum bytes
pub fn verify_checksum(
    kind: ChecksumKind,
    command: Command,
    covered: &[u8],
    received: &[u8],
) -> Result<(), ProtocolError> {
    let expected = kind.compute(covered);
    let actual = kind.read(received);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch {
            command,
            expected,
            actual,
        });
    }
    Ok(())
}
