//! Protocol description
//!
//! The device's command table: opcode, request/response payload lengths and
//! checksum kind for every command the engine issues. Every value of the
//! compiled-in defaults can be overridden from the config file.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::ProtocolError;
use crate::session::{HEADER_LEN, MAX_CHANNELS};

/// Maximum number of handles one list response may carry
pub const MAX_SESSION_HANDLES: usize = 256;

/// Maximum number of epochs a device session holds
pub const MAX_DEVICE_EPOCHS: usize = 4096;

/// Commands issued to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Read device serial, firmware version and stored session count
    Identify,
    /// Enumerate handles of stored sessions
    ListSessions,
    /// Read one stored session block
    FetchSession,
}

impl Command {
    /// All commands, in table order
    pub const ALL: [Command; 3] = [
        Command::Identify,
        Command::ListSessions,
        Command::FetchSession,
    ];
}

/// Checksum algorithm trailing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// 8-bit wrapping sum of all bytes
    Sum8,
    /// 8-bit XOR of all bytes
    Xor8,
    /// CRC-32 (IEEE), little-endian on the wire
    Crc32,
}

impl ChecksumKind {
    /// Width of the checksum field in bytes
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::Sum8 | ChecksumKind::Xor8 => 1,
            ChecksumKind::Crc32 => 4,
        }
    }

    /// Compute the checksum over `data`
    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::Sum8 => data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) as u32,
            ChecksumKind::Xor8 => data.iter().fold(0u8, |acc, b| acc ^ b) as u32,
            ChecksumKind::Crc32 => {
                let mut hasher = Hasher::new();
                hasher.update(data);
                hasher.finalize()
            }
        }
    }

    /// Append `value` in wire format
    pub fn append(self, value: u32, out: &mut Vec<u8>) {
        match self {
            ChecksumKind::Sum8 | ChecksumKind::Xor8 => out.push(value as u8),
            ChecksumKind::Crc32 => {
                let mut bytes = [0u8; 4];
                LittleEndian::write_u32(&mut bytes, value);
                out.extend_from_slice(&bytes);
            }
        }
    }

    /// Read a checksum value from exactly [`width`](Self::width) bytes
    pub fn read(self, bytes: &[u8]) -> u32 {
        match self {
            ChecksumKind::Sum8 | ChecksumKind::Xor8 => bytes[0] as u32,
            ChecksumKind::Crc32 => LittleEndian::read_u32(bytes),
        }
    }
}

/// Allowed payload length of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadLength {
    /// Exactly this many bytes
    Fixed(u16),
    /// Any length up to and including this many bytes
    UpTo(u16),
}

impl PayloadLength {
    pub fn accepts(self, len: usize) -> bool {
        match self {
            PayloadLength::Fixed(n) => len == n as usize,
            PayloadLength::UpTo(n) => len <= n as usize,
        }
    }
}

/// One row of the command table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub opcode: u8,
    pub request: PayloadLength,
    pub response: PayloadLength,
    pub checksum: ChecksumKind,
}

/// Static description of the device protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolDescription {
    /// First byte of every frame
    pub sync: u8,
    /// OR-ed into the opcode of every response
    pub response_flag: u8,
    /// Opcode of a rejection frame (one-byte error code payload)
    pub nak_opcode: u8,
    pub identify: CommandSpec,
    pub list_sessions: CommandSpec,
    pub fetch_session: CommandSpec,
}

impl Default for ProtocolDescription {
    fn default() -> Self {
        Self {
            sync: 0xA5,
            response_flag: 0x80,
            nak_opcode: 0x7F,
            identify: CommandSpec {
                opcode: 0x01,
                request: PayloadLength::Fixed(0),
                response: PayloadLength::Fixed(8),
                checksum: ChecksumKind::Sum8,
            },
            list_sessions: CommandSpec {
                opcode: 0x02,
                request: PayloadLength::Fixed(0),
                response: PayloadLength::UpTo((2 + 2 * MAX_SESSION_HANDLES) as u16),
                checksum: ChecksumKind::Crc32,
            },
            fetch_session: CommandSpec {
                opcode: 0x03,
                request: PayloadLength::Fixed(2),
                response: PayloadLength::UpTo(
                    (HEADER_LEN + MAX_DEVICE_EPOCHS * MAX_CHANNELS) as u16,
                ),
                checksum: ChecksumKind::Crc32,
            },
        }
    }
}

impl ProtocolDescription {
    /// Table row for a command
    pub fn spec(&self, command: Command) -> &CommandSpec {
        match command {
            Command::Identify => &self.identify,
            Command::ListSessions => &self.list_sessions,
            Command::FetchSession => &self.fetch_session,
        }
    }

    /// Opcode a response to `command` carries
    pub fn response_opcode(&self, command: Command) -> u8 {
        self.spec(command).opcode | self.response_flag
    }

    /// Reject tables the engine could not speak unambiguously
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut seen = HashSet::new();
        for command in Command::ALL {
            let opcode = self.spec(command).opcode;
            if opcode & self.response_flag != 0 {
                return Err(ProtocolError::InvalidDescription(format!(
                    "{:?} opcode {:#04x} overlaps response flag {:#04x}",
                    command, opcode, self.response_flag
                )));
            }
            if !seen.insert(opcode) {
                return Err(ProtocolError::InvalidDescription(format!(
                    "duplicate opcode {:#04x}",
                    opcode
                )));
            }
            if self.response_opcode(command) == self.nak_opcode {
                return Err(ProtocolError::InvalidDescription(format!(
                    "{:?} response opcode collides with NAK opcode",
                    command
                )));
            }
        }
        if self.response_flag == 0 {
            return Err(ProtocolError::InvalidDescription(
                "response flag must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
