//! Serial Transport
//!
//! Owns the physical connection to the device: port discovery, probing,
//! bounded-timeout reads and reconnection.
//!
//! The link is exclusive. A [`Transport`] holds the only handle to the open
//! port for the lifetime of one connection and releases it on [`Transport::close`]
//! or when dropped.

mod error;
pub mod serial;

pub use error::TransportError;
pub use serial::{list_ports, PortInfo, SerialPortLink, SerialPortOpener};

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default baud rate of the device's docking cable
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Handshake byte the device echoes back when it is docked and idle
pub const PROBE_BYTE: u8 = 0x56;

/// How long the line must stay silent before [`Transport::drain`] considers it quiet
const DRAIN_QUIET_MS: u64 = 50;

/// Byte-level access to one open port.
///
/// `read_bytes` waits at most the link's own poll timeout; returning `Ok(0)` or
/// an `io::ErrorKind::TimedOut` error both mean "nothing arrived yet".
pub trait SerialLink: Send {
    /// Name of the port this link is attached to
    fn port_name(&self) -> &str;

    /// Write all bytes to the line
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard anything buffered on the receive side
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens a [`SerialLink`] by port name
pub trait PortOpener: Send + Sync {
    fn open_link(&self, port_name: &str) -> Result<Box<dyn SerialLink>, TransportError>;
}

/// Transport timing and probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes written to a candidate port when probing it
    pub probe_request: Vec<u8>,
    /// Bytes a live device answers the probe with
    pub probe_response: Vec<u8>,
    /// Timeout for the probe answer in milliseconds
    pub probe_timeout_ms: u64,
    /// Per-attempt timeout for `read_exact` in milliseconds
    pub read_timeout_ms: u64,
    /// How many times a timed-out read window is retried before failing
    pub read_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            probe_request: vec![PROBE_BYTE],
            probe_response: vec![PROBE_BYTE],
            probe_timeout_ms: 500,
            read_timeout_ms: 2000,
            read_retries: 2,
        }
    }
}

impl TransportConfig {
    /// Per-attempt read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// An open, probed connection to the device
pub struct Transport {
    link: Option<Box<dyn SerialLink>>,
    port_name: String,
    opener: Option<Arc<dyn PortOpener>>,
    config: TransportConfig,
    cancel: Option<CancellationToken>,
    /// Cumulative bytes sent / received
    tx_bytes: u64,
    rx_bytes: u64,
}

impl Transport {
    /// Probe each candidate port in order and keep the first one whose device
    /// answers the handshake.
    pub fn open(
        opener: Arc<dyn PortOpener>,
        candidates: &[String],
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        for name in candidates {
            let link = match opener.open_link(name) {
                Ok(link) => link,
                Err(e) => {
                    debug!(port = %name, "skipping port: {}", e);
                    continue;
                }
            };

            let mut transport = Transport {
                link: Some(link),
                port_name: name.clone(),
                opener: Some(opener.clone()),
                config: config.clone(),
                cancel: None,
                tx_bytes: 0,
                rx_bytes: 0,
            };

            match transport.probe() {
                Ok(()) => {
                    info!(port = %name, "device answered probe");
                    return Ok(transport);
                }
                Err(e) => {
                    debug!(port = %name, "probe failed: {}", e);
                    transport.close();
                }
            }
        }

        Err(TransportError::NoDeviceFound {
            probed: candidates.len(),
        })
    }

    /// Wrap an already-open link without probing it. The transport cannot
    /// reconnect, since it does not know how the link was opened.
    pub fn from_link(link: Box<dyn SerialLink>, config: TransportConfig) -> Self {
        Transport {
            port_name: link.port_name().to_string(),
            link: Some(link),
            opener: None,
            config,
            cancel: None,
            tx_bytes: 0,
            rx_bytes: 0,
        }
    }

    /// Attach a cancellation token; pending and future reads fail with
    /// [`TransportError::Cancelled`] once it fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Name of the port in use
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether the port is still held
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Transport settings
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Cumulative (tx, rx) byte counters
    pub fn counters(&self) -> (u64, u64) {
        (self.tx_bytes, self.rx_bytes)
    }

    fn check_cancelled(&self) -> Result<(), TransportError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(TransportError::Cancelled),
            _ => Ok(()),
        }
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn SerialLink>, TransportError> {
        self.link.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Write all bytes to the device
    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.check_cancelled()?;
        let link = self.link_mut()?;
        link.write_bytes(data)?;
        self.tx_bytes = self.tx_bytes.saturating_add(data.len() as u64);
        debug!("tx {} bytes: {:02x?}", data.len(), data);
        Ok(())
    }

    /// Read exactly `n` bytes, accumulating across as many reads as needed.
    ///
    /// Bytes that arrive are kept across timeout windows; the window is restarted
    /// up to `read_retries` times before the read fails with
    /// [`TransportError::Timeout`].
    pub fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(n);
        let mut buffer = [0u8; 512];
        let mut retries = 0u32;
        let mut deadline = Instant::now() + timeout;

        while out.len() < n {
            self.check_cancelled()?;

            let want = (n - out.len()).min(buffer.len());
            let link = self.link_mut()?;
            match link.read_bytes(&mut buffer[..want]) {
                Ok(0) => {}
                Ok(k) => {
                    out.extend_from_slice(&buffer[..k]);
                    continue;
                }
                Err(ref e) if is_timeout(e) => {}
                Err(e) => return Err(TransportError::Io(e)),
            }

            if Instant::now() >= deadline {
                if retries >= self.config.read_retries {
                    self.rx_bytes = self.rx_bytes.saturating_add(out.len() as u64);
                    return Err(TransportError::Timeout {
                        expected: n,
                        received: out.len(),
                    });
                }
                retries += 1;
                debug!(
                    "read_exact: timeout with {}/{} bytes, retry {}/{}",
                    out.len(),
                    n,
                    retries,
                    self.config.read_retries
                );
                deadline = Instant::now() + timeout;
            }
        }

        self.rx_bytes = self.rx_bytes.saturating_add(out.len() as u64);
        Ok(out)
    }

    /// Discard incoming bytes until the line has been silent for a short while.
    /// Returns the number of bytes thrown away.
    ///
    /// A line that never goes quiet fails with [`TransportError::Timeout`] once
    /// the read timeout has passed.
    pub fn drain(&mut self) -> Result<usize, TransportError> {
        let quiet = Duration::from_millis(DRAIN_QUIET_MS);
        let deadline = Instant::now() + self.config.read_timeout() + quiet;
        let mut discarded = 0usize;
        let mut buffer = [0u8; 256];
        let mut last_data = Instant::now();

        self.link_mut()?.clear_input()?;

        while last_data.elapsed() < quiet {
            self.check_cancelled()?;
            if Instant::now() >= deadline {
                warn!("drain: line still busy after discarding {} bytes", discarded);
                return Err(TransportError::Timeout {
                    expected: 0,
                    received: discarded,
                });
            }

            match self.link_mut()?.read_bytes(&mut buffer) {
                Ok(0) => {}
                Ok(k) => {
                    discarded += k;
                    last_data = Instant::now();
                }
                Err(ref e) if is_timeout(e) => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        if discarded > 0 {
            debug!("drain: discarded {} stale bytes", discarded);
        }
        Ok(discarded)
    }

    /// Close and reopen the same port, re-running the probe
    pub fn reconnect(&mut self) -> Result<(), TransportError> {
        let opener = self.opener.clone().ok_or(TransportError::NotConnected)?;
        warn!(port = %self.port_name, "reconnecting");
        self.close();
        self.check_cancelled()?;
        self.link = Some(opener.open_link(&self.port_name)?);
        if let Err(e) = self.probe() {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Release the port. Safe to call more than once.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(port = %self.port_name, "port closed");
        }
    }

    fn probe(&mut self) -> Result<(), TransportError> {
        let request = self.config.probe_request.clone();
        let expected = self.config.probe_response.clone();
        let timeout = self.config.probe_timeout();

        self.link_mut()?.clear_input()?;
        self.write(&request)?;

        // A single window: a silent port is simply not our device
        let retries = std::mem::replace(&mut self.config.read_retries, 0);
        let answer = self.read_exact(expected.len(), timeout);
        self.config.read_retries = retries;

        let answer = answer?;
        if answer != expected {
            return Err(TransportError::Serial(format!(
                "unexpected probe answer {:02x?}",
                answer
            )));
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Ports to try, in order: the configured port alone if set, otherwise every
/// discovered port.
pub fn candidate_ports(configured: Option<&str>) -> Vec<String> {
    match configured {
        Some(port) => vec![port.to_string()],
        None => list_ports().into_iter().map(|p| p.name).collect(),
    }
}
