//! Control protocol of the USB-serial I2C bridge.
//!
//! Requests are `[len:u16le, id, bus, page, cmd, data..]` where `len` counts
//! the whole packet. Responses are `[len:u16le, id, data..]` where `len`
//! counts only `data`. An error response carries `0xff, code` as data.

use std::fmt;

use scroll::{Pread, Pwrite};

use crate::{Error, Result};

/// Bus selector, the bridge exposes a single bus.
const BUS: u8 = 0x00;
/// Page of the I2C command set.
const PAGE_I2C: u8 = 0x05;
const ERROR_MARKER: u8 = 0xff;

pub mod commands {
    pub const SET_FREQUENCY: u8 = 0x10;
    pub const WRITE: u8 = 0x20;
    pub const READ: u8 = 0x30;
    pub const WRITE_READ: u8 = 0x40;
}

pub mod error_codes {
    /// The target did not acknowledge.
    pub const TIMEOUT: u8 = 0x10;
    pub const INVALID_COMMAND: u8 = 0x11;
    pub const BUFFER_OVERFLOW: u8 = 0x12;
    pub const CUSTOM: u8 = 0xff;
}

/// I2C bridge command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Change the bus clock.
    SetFrequency { hz: u32 },
    /// Plain write, terminated with a stop.
    Write { address: u8, data: Vec<u8> },
    /// Plain read of `len` bytes.
    Read { address: u8, len: u8 },
    /// Write followed by a repeated start and a read of `len` bytes.
    WriteRead { address: u8, data: Vec<u8>, len: u8 },
}

impl Command {
    pub fn write(address: u8, data: &[u8]) -> Self {
        Command::Write {
            address,
            data: data.to_vec(),
        }
    }

    pub fn read(address: u8, len: u8) -> Self {
        Command::Read { address, len }
    }

    pub fn write_read(address: u8, data: &[u8], len: u8) -> Self {
        Command::WriteRead {
            address,
            data: data.to_vec(),
            len,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Command::SetFrequency { .. } => commands::SET_FREQUENCY,
            Command::Write { .. } => commands::WRITE,
            Command::Read { .. } => commands::READ,
            Command::WriteRead { .. } => commands::WRITE_READ,
        }
    }

    pub fn into_raw(self, id: u8) -> Result<Vec<u8>> {
        let code = self.code();
        let payload = match self {
            Command::SetFrequency { hz } => {
                let mut buf = [0u8; 4];
                buf.pwrite_with(hz, 0, scroll::LE)?;
                buf.to_vec()
            }
            Command::Write { address, data } => {
                let mut buf = Vec::with_capacity(1 + data.len());
                buf.push(address);
                buf.extend(data);
                buf
            }
            Command::Read { address, len } => vec![address, len],
            Command::WriteRead { address, data, len } => {
                let mut buf = Vec::with_capacity(2 + data.len());
                buf.push(address);
                buf.extend(data);
                buf.push(len);
                buf
            }
        };

        // LEN, ID, BUS, PAGE, CMD, DATA
        let total = 6 + payload.len();
        let mut buf = vec![0u8; total];
        buf.pwrite_with(total as u16, 0, scroll::LE)?;
        buf[2] = id;
        buf[3] = BUS;
        buf[4] = PAGE_I2C;
        buf[5] = code;
        buf[6..].copy_from_slice(&payload);
        Ok(buf)
    }
}

/// Response to a Command. The request id is returned alongside.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Response {
    Ok(Vec<u8>),
    /// Error code and optional message bytes
    Err(u8, Vec<u8>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Err(code, data) => write!(f, "ERROR({:x})[{}]", code, hex::encode(data)),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_, payload) => payload,
        }
    }

    /// Parses a full response frame, returning its id.
    pub(crate) fn from_raw(raw: &[u8]) -> Result<(u8, Self)> {
        let len = raw.pread_with::<u16>(0, scroll::LE)? as usize;
        let id = raw.pread::<u8>(2)?;
        let data = &raw[3..];
        if data.len() != len {
            return Err(Error::Transport(format!(
                "response length {} does not match header {}",
                data.len(),
                len
            )));
        }
        if data.len() >= 2 && data[0] == ERROR_MARKER {
            Ok((id, Response::Err(data[1], data[2..].to_vec())))
        } else {
            Ok((id, Response::Ok(data.to_vec())))
        }
    }
}
