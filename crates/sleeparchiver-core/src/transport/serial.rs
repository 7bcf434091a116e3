//! Serial port handling
//!
//! Provides low-level serial port access for the device link.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::{PortOpener, SerialLink, TransportError};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key so that ttyACM* ports come first, then ttyUSB*, then the rest by name.
/// Numeric suffixes sort numerically.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// macOS exposes every device twice; the `tty.*` call-in node blocks on open
/// until carrier detect, so only the `cu.*` twin is usable.
fn is_call_in_duplicate(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    basename.starts_with("tty.")
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        if is_call_in_duplicate(&p.name) {
            continue;
        }
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: ttyACM*/ttyUSB* nodes that udev has not announced yet
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with a short per-call read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    poll_timeout: Duration,
) -> Result<Box<dyn SerialPort>, TransportError> {
    serialport::new(name, baud_rate)
        .timeout(poll_timeout)
        .open()
        .map_err(|e| TransportError::Serial(format!("{}: {}", name, e)))
}

/// Configure a serial port for the device: 8N1, no flow control, DTR on, RTS off
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // The docking cable draws power from DTR; RTS must stay low or the
    // device stays in its reset state.
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("configure_port: failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(false) {
        warn!("configure_port: failed to clear RTS: {} (continuing)", e);
    }

    Ok(())
}

/// A [`SerialLink`] backed by a real serial port
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Opens [`SerialPortLink`]s with a fixed baud rate
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    baud_rate: u32,
    poll_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(baud_rate: u32, poll_timeout: Duration) -> Self {
        Self {
            baud_rate,
            poll_timeout,
        }
    }
}

impl PortOpener for SerialPortOpener {
    fn open_link(&self, port_name: &str) -> Result<Box<dyn SerialLink>, TransportError> {
        debug!(port = port_name, baud = self.baud_rate, "opening serial port");
        let mut port = open_port(port_name, self.baud_rate, self.poll_timeout)?;
        configure_port(port.as_mut())?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Box::new(SerialPortLink {
            name: port_name.to_string(),
            port,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic without hardware
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo::bare(n.to_string()))
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_call_in_duplicates_skipped() {
        assert!(is_call_in_duplicate("/dev/tty.usbserial-A1"));
        assert!(!is_call_in_duplicate("/dev/cu.usbserial-A1"));
        assert!(!is_call_in_duplicate("/dev/ttyUSB0"));
        assert!(!is_call_in_duplicate("COM3"));
    }
}
