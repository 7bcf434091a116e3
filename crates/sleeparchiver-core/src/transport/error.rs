//! Transport errors

use thiserror::Error;

/// Errors that can occur on the serial link itself
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No device found (probed {probed} port(s))")]
    NoDeviceFound { probed: usize },

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Read timeout: expected {expected} bytes, received {received}")]
    Timeout { expected: usize, received: usize },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}
