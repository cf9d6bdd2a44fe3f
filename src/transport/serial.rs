//! Serial link to the I2C bridge.
use std::io::{Read, Write};
use std::time::Duration;

use scroll::Pread;
use serialport::SerialPort;

use super::Transport;
use crate::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BAUDRATE: u32 = 115200;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    /// Opens the first port the system reports.
    pub fn open_any(baudrate: u32) -> Result<Self> {
        let ports = Self::scan_ports()?;
        log::debug!("serial ports: {:?}", ports);
        match ports.first() {
            Some(port) => Self::open(port, baudrate),
            None => Err(Error::Transport("no serial ports found".into())),
        }
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        // Length and id
        let mut header = [0u8; 3];
        self.serial_port.read_exact(&mut header)?;
        let len = header[..].pread_with::<u16>(0, scroll::LE)? as usize;

        let mut frame = vec![0u8; 3 + len];
        frame[..3].copy_from_slice(&header);
        self.serial_port.read_exact(&mut frame[3..])?;
        Ok(frame)
    }
}
