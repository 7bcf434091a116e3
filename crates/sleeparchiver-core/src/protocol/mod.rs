//! Device Protocol
//!
//! Implements the docking protocol of the sleep monitor: framed requests and
//! responses with a trailing checksum, driven by a static command table.

pub mod description;
mod engine;
mod error;
pub mod frame;

pub use description::{ChecksumKind, Command, CommandSpec, PayloadLength, ProtocolDescription};
pub use engine::{DeviceInfo, EngineState, ProtocolEngine, SessionHandle};
pub use error::ProtocolError;
pub use frame::{Frame, FrameHeader};
