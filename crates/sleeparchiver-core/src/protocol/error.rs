//! Protocol errors

use thiserror::Error;

use super::Command;
use crate::transport::TransportError;

/// Errors that can occur while exchanging frames with the device
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Checksum mismatch on {command:?}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        command: Command,
        expected: u32,
        actual: u32,
    },

    #[error("Bad sync byte: expected {expected:#04x}, got {actual:#04x}")]
    BadSync { expected: u8, actual: u8 },

    #[error("Unexpected opcode: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("Payload length {length} out of range for {command:?}")]
    LengthOutOfRange { command: Command, length: usize },

    #[error("Request payload of {length} bytes does not fit {command:?}")]
    RequestLength { command: Command, length: usize },

    #[error("Device rejected {command:?} with code {code:#04x}")]
    DeviceRejected { command: Command, code: u8 },

    #[error("Invalid response to {command:?}: {reason}")]
    InvalidResponse { command: Command, reason: String },

    #[error("Invalid protocol description: {0}")]
    InvalidDescription(String),
}

impl ProtocolError {
    /// Whether repeating the same request may succeed. Line noise and framing
    /// slips qualify; transport failures and device rejections do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::BadSync { .. }
                | ProtocolError::UnexpectedOpcode { .. }
                | ProtocolError::LengthOutOfRange { .. }
                | ProtocolError::InvalidResponse { .. }
        )
    }

    /// Whether the error means the connection itself is gone
    pub fn is_connection_level(&self) -> bool {
        matches!(self, ProtocolError::Transport(_))
    }
}
