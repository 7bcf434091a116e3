//! Scripted device for integration tests
//!
//! `FakeDevice` parses each request frame written to it and queues the framed
//! response a real watch would send, so the whole stack above `SerialLink` runs
//! unmodified.

#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sleeparchiver_core::protocol::{Command, Frame, ProtocolDescription};
use sleeparchiver_core::session::SessionBlockBuilder;
use sleeparchiver_core::transport::{SerialLink, Transport, TransportConfig};

/// Route library logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type RequestLog = Arc<Mutex<Vec<Vec<u8>>>>;

pub struct FakeDevice {
    pub serial: u32,
    pub description: ProtocolDescription,
    /// Stored sessions, in listing order
    pub sessions: Vec<(u16, Vec<u8>)>,
    /// Handle -> number of responses still to be corrupted in transit
    pub corrupt: HashMap<u16, usize>,
    /// Handles the device refuses to send
    pub reject: HashSet<u16>,
    /// Handles the device lists but never answers for
    pub silent: HashSet<u16>,
    /// Called with the handle of every fetch request
    pub on_fetch: Option<Box<dyn Fn(u16) + Send>>,
    pending: VecDeque<u8>,
    requests: RequestLog,
}

impl FakeDevice {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            description: ProtocolDescription::default(),
            sessions: Vec::new(),
            corrupt: HashMap::new(),
            reject: HashSet::new(),
            silent: HashSet::new(),
            on_fetch: None,
            pending: VecDeque::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_session(mut self, handle: u16, block: Vec<u8>) -> Self {
        self.sessions.push((handle, block));
        self
    }

    pub fn requests(&self) -> RequestLog {
        Arc::clone(&self.requests)
    }

    /// Wrap the device in a transport with short timeouts
    pub fn into_transport(self) -> (Transport, RequestLog) {
        let requests = self.requests();
        let config = TransportConfig {
            read_timeout_ms: 20,
            read_retries: 0,
            ..Default::default()
        };
        (Transport::from_link(Box::new(self), config), requests)
    }

    fn respond(&mut self, request: &[u8]) {
        let desc = self.description.clone();
        let opcode = request[1];
        let command = Command::ALL
            .into_iter()
            .find(|c| desc.spec(*c).opcode == opcode);
        let Some(command) = command else {
            return;
        };

        let mut handle = None;
        let payload = match command {
            Command::Identify => {
                let mut p = vec![0u8; 8];
                LittleEndian::write_u32(&mut p[0..4], self.serial);
                p[4] = 1;
                p[5] = 4;
                LittleEndian::write_u16(&mut p[6..8], self.sessions.len() as u16);
                p
            }
            Command::ListSessions => {
                let mut p = vec![0u8; 2];
                LittleEndian::write_u16(&mut p[0..2], self.sessions.len() as u16);
                for (h, _) in &self.sessions {
                    let mut raw = [0u8; 2];
                    LittleEndian::write_u16(&mut raw, *h);
                    p.extend_from_slice(&raw);
                }
                p
            }
            Command::FetchSession => {
                let h = LittleEndian::read_u16(&request[4..6]);
                handle = Some(h);
                if let Some(hook) = &self.on_fetch {
                    hook(h);
                }
                if self.silent.contains(&h) {
                    return;
                }
                if self.reject.contains(&h) {
                    let nak = Frame::new(desc.nak_opcode, vec![0x04])
                        .encode(desc.sync, desc.fetch_session.checksum);
                    self.pending.extend(nak);
                    return;
                }
                match self.sessions.iter().find(|(sh, _)| *sh == h) {
                    Some((_, block)) => block.clone(),
                    None => return,
                }
            }
        };

        let mut frame = Frame::new(desc.response_opcode(command), payload)
            .encode(desc.sync, desc.spec(command).checksum);

        if let Some(h) = handle {
            if let Some(remaining) = self.corrupt.get_mut(&h) {
                if *remaining > 0 {
                    *remaining -= 1;
                    frame[5] ^= 0x01;
                }
            }
        }
        self.pending.extend(frame);
    }
}

impl SerialLink for FakeDevice {
    fn port_name(&self) -> &str {
        "fake"
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.requests.lock().unwrap().push(data.to_vec());
        self.respond(data);
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

/// A one-night, single-channel block
pub fn night_block(start: u32, serial: u32) -> Vec<u8> {
    SessionBlockBuilder::new(start, 28_800, serial)
        .repeat_epoch(960, &[10])
        .build()
}

/// Number of fetch requests in a request log
pub fn fetch_count(requests: &RequestLog) -> usize {
    let opcode = ProtocolDescription::default().fetch_session.opcode;
    requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.get(1) == Some(&opcode))
        .count()
}
