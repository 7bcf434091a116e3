//! Protocol engine
//!
//! Speaks the device's request/response dialect over a [`Transport`]. The link
//! is half-duplex: every response is read in full (header, declared payload,
//! checksum) before the next request goes out.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, trace, warn};

use super::frame::{verify_checksum, Frame, FrameHeader, FRAME_HEADER_LEN};
use super::{Command, ProtocolDescription, ProtocolError};
use crate::transport::Transport;

/// Attempts per request: the original plus one retry
const MAX_ATTEMPTS: u32 = 2;

/// Opaque device-side reference to one stored session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u16);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the device reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: u32,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub stored_sessions: u16,
}

impl DeviceInfo {
    fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 8 {
            return Err(ProtocolError::InvalidResponse {
                command: Command::Identify,
                reason: format!("{} bytes, need 8", payload.len()),
            });
        }
        Ok(Self {
            serial: LittleEndian::read_u32(&payload[0..4]),
            firmware_major: payload[4],
            firmware_minor: payload[5],
            stored_sessions: LittleEndian::read_u16(&payload[6..8]),
        })
    }
}

/// Receive-side state of the current exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingHeader,
    AwaitingPayload { length: usize },
    AwaitingChecksum,
}

/// Request/response driver for one connection
pub struct ProtocolEngine<'t> {
    transport: &'t mut Transport,
    description: ProtocolDescription,
    state: EngineState,
}

impl<'t> ProtocolEngine<'t> {
    /// Create an engine over an open transport
    pub fn new(
        transport: &'t mut Transport,
        description: ProtocolDescription,
    ) -> Result<Self, ProtocolError> {
        description.validate()?;
        Ok(Self {
            transport,
            description,
            state: EngineState::Idle,
        })
    }

    /// Current receive state; `Idle` between exchanges
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Read serial number, firmware version and stored session count
    pub fn identify(&mut self) -> Result<DeviceInfo, ProtocolError> {
        let payload = self.exchange(Command::Identify, &[])?;
        let info = DeviceInfo::parse(&payload)?;
        info!(
            serial = info.serial,
            "device firmware {}.{}, {} stored session(s)",
            info.firmware_major,
            info.firmware_minor,
            info.stored_sessions
        );
        Ok(info)
    }

    /// Enumerate handles of all stored sessions
    pub fn list_session_handles(&mut self) -> Result<Vec<SessionHandle>, ProtocolError> {
        let payload = self.exchange(Command::ListSessions, &[])?;
        if payload.len() < 2 {
            return Err(ProtocolError::InvalidResponse {
                command: Command::ListSessions,
                reason: "missing handle count".to_string(),
            });
        }

        let count = LittleEndian::read_u16(&payload[0..2]) as usize;
        if payload.len() != 2 + count * 2 {
            return Err(ProtocolError::InvalidResponse {
                command: Command::ListSessions,
                reason: format!(
                    "{} handles declared but payload holds {} bytes",
                    count,
                    payload.len() - 2
                ),
            });
        }

        let handles: Vec<SessionHandle> = payload[2..]
            .chunks_exact(2)
            .map(|c| SessionHandle(LittleEndian::read_u16(c)))
            .collect();
        debug!("device lists {} session(s): {:?}", handles.len(), handles);
        Ok(handles)
    }

    /// Fetch the raw block of one stored session. The block has passed checksum
    /// validation but is not yet decoded.
    pub fn fetch_session(&mut self, handle: SessionHandle) -> Result<Vec<u8>, ProtocolError> {
        let mut request = [0u8; 2];
        LittleEndian::write_u16(&mut request, handle.0);
        let block = self.exchange(Command::FetchSession, &request)?;
        debug!("fetched session {} ({} bytes)", handle, block.len());
        trace!("session {} block: {:02x?}", handle, block);
        Ok(block)
    }

    /// Run one request, retrying once if the response was damaged in transit.
    /// The line is drained after every non-transport failure so the next
    /// request starts on a frame boundary.
    fn exchange(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if !self.description.spec(command).request.accepts(payload.len()) {
            return Err(ProtocolError::RequestLength {
                command,
                length: payload.len(),
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.transact(command, payload);
            self.state = EngineState::Idle;

            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => {
                    self.transport.drain()?;
                    if e.is_retryable() && attempt < MAX_ATTEMPTS {
                        warn!("{:?} attempt {} failed: {}; retrying", command, attempt, e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn transact(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let spec = *self.description.spec(command);
        let sync = self.description.sync;

        let request = Frame::new(spec.opcode, payload.to_vec()).encode(sync, spec.checksum);
        self.transport.write(&request)?;
        let timeout = self.transport.config().read_timeout();

        self.state = EngineState::AwaitingHeader;
        let raw = self.transport.read_exact(FRAME_HEADER_LEN, timeout)?;
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&raw);
        let header = FrameHeader::parse(&header_bytes);

        if header.sync != sync {
            return Err(ProtocolError::BadSync {
                expected: sync,
                actual: header.sync,
            });
        }

        let length = header.length as usize;
        let rejected = header.opcode == self.description.nak_opcode;
        if rejected {
            if length != 1 {
                return Err(ProtocolError::InvalidResponse {
                    command,
                    reason: format!("rejection frame with {} byte payload", length),
                });
            }
        } else {
            let expected = self.description.response_opcode(command);
            if header.opcode != expected {
                return Err(ProtocolError::UnexpectedOpcode {
                    expected,
                    actual: header.opcode,
                });
            }
            if !spec.response.accepts(length) {
                return Err(ProtocolError::LengthOutOfRange { command, length });
            }
        }

        self.state = EngineState::AwaitingPayload { length };
        let body = self.transport.read_exact(length, timeout)?;

        self.state = EngineState::AwaitingChecksum;
        let received = self.transport.read_exact(spec.checksum.width(), timeout)?;

        let mut covered = Vec::with_capacity(FRAME_HEADER_LEN - 1 + length);
        covered.extend_from_slice(&header_bytes[1..]);
        covered.extend_from_slice(&body);
        verify_checksum(spec.checksum, command, &covered, &received)?;

        if rejected {
            return Err(ProtocolError::DeviceRejected {
                command,
                code: body[0],
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChecksumKind, PayloadLength};
    use crate::transport::{SerialLink, TransportConfig};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Answers each request with the next queued response
    struct QueueLink {
        responses: VecDeque<Vec<u8>>,
        pending: VecDeque<u8>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl SerialLink for QueueLink {
        fn port_name(&self) -> &str {
            "queue"
        }

        fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
            self.requests.lock().unwrap().push(data.to_vec());
            if let Some(response) = self.responses.pop_front() {
                self.pending.extend(response);
            }
            Ok(())
        }

        fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(0);
            }
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.pending.clear();
            Ok(())
        }
    }

    fn transport_with(responses: Vec<Vec<u8>>) -> (Transport, Arc<Mutex<Vec<Vec<u8>>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let link = QueueLink {
            responses: responses.into(),
            pending: VecDeque::new(),
            requests: requests.clone(),
        };
        let config = TransportConfig {
            read_timeout_ms: 20,
            read_retries: 0,
            ..Default::default()
        };
        (Transport::from_link(Box::new(link), config), requests)
    }

    fn response(command: Command, payload: Vec<u8>) -> Vec<u8> {
        let desc = ProtocolDescription::default();
        let spec = desc.spec(command);
        Frame::new(desc.response_opcode(command), payload).encode(desc.sync, spec.checksum)
    }

    #[test]
    fn test_identify() {
        let (mut transport, requests) = transport_with(vec![response(
            Command::Identify,
            vec![0x78, 0x56, 0x34, 0x12, 2, 7, 3, 0],
        )]);
        let mut engine = ProtocolEngine::new(&mut transport, Default::default()).unwrap();

        let info = engine.identify().unwrap();
        assert_eq!(info.serial, 0x1234_5678);
        assert_eq!((info.firmware_major, info.firmware_minor), (2, 7));
        assert_eq!(info.stored_sessions, 3);
        assert_eq!(engine.state(), EngineState::Idle);

        // sync, opcode 0x01, zero length, sum8 of (01 00 00)
        assert_eq!(requests.lock().unwrap()[0], vec![0xA5, 0x01, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_list_handles() {
        let (mut transport, _) = transport_with(vec![response(
            Command::ListSessions,
            vec![2, 0, 0x10, 0x00, 0x11, 0x00],
        )]);
        let mut engine = ProtocolEngine::new(&mut transport, Default::default()).unwrap();

        let handles = engine.list_session_handles().unwrap();
        assert_eq!(handles, vec![SessionHandle(0x10), SessionHandle(0x11)]);
    }

    #[test]
    fn test_list_count_mismatch_is_rejected() {
        let bad = response(Command::ListSessions, vec![3, 0, 0x10, 0x00]);
        let (mut transport, requests) = transport_with(vec![bad.clone(), bad]);
        let mut engine = ProtocolEngine::new(&mut transport, Default::default()).unwrap();

        assert!(matches!(
            engine.list_session_handles(),
            Err(ProtocolError::InvalidResponse { .. })
        ));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_error_retried_once() {
        let good = response(Command::FetchSession, vec![1, 2, 3]);
        let mut bad = good.clone();
        bad[5] ^= 0x40;

        let (mut transport, requests) = transport_with(vec![bad, good]);
        let mut engine = ProtocolEngine::new(&mut transport, Default::default()).unwrap();

        let block = engine.fetch_session(SessionHandle(4)).unwrap();
        assert_eq!(block, vec![1, 2, 3]);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_device_rejection_not_retried() {
        let desc = ProtocolDescription::default();
        let nak = Frame::new(desc.nak_opcode, vec![0x02])
            .encode(desc.sync, desc.fetch_session.checksum);
        let (mut transport, requests) = transport_with(vec![nak]);
        let mut engine = ProtocolEngine::new(&mut transport, desc).unwrap();

        assert!(matches!(
            engine.fetch_session(SessionHandle(9)),
            Err(ProtocolError::DeviceRejected {
                command: Command::FetchSession,
                code: 0x02
            })
        ));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_silence_is_connection_level() {
        let (mut transport, _) = transport_with(vec![]);
        let mut engine = ProtocolEngine::new(&mut transport, Default::default()).unwrap();

        let err = engine.identify().unwrap_err();
        assert!(err.is_connection_level());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_bad_request_length_never_sent() {
        let mut desc = ProtocolDescription::default();
        desc.fetch_session.request = PayloadLength::Fixed(4);
        let (mut transport, requests) = transport_with(vec![]);
        let mut engine = ProtocolEngine::new(&mut transport, desc).unwrap();

        let err = engine.fetch_session(SessionHandle(1)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::RequestLength {
                command: Command::FetchSession,
                length: 2
            }
        ));
        assert!(!err.is_retryable());
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_response_rejected() {
        let desc = ProtocolDescription::default();
        let oversized = Frame::new(desc.response_opcode(Command::Identify), vec![0; 9])
            .encode(desc.sync, ChecksumKind::Sum8);
        let (mut transport, _) = transport_with(vec![oversized.clone(), oversized]);
        let mut engine = ProtocolEngine::new(&mut transport, desc).unwrap();

        assert!(matches!(
            engine.identify(),
            Err(ProtocolError::LengthOutOfRange {
                command: Command::Identify,
                length: 9
            })
        ));
    }
}
