//! Abstract bus and transport interfaces.
use std::time::Duration;

use crate::Result;
use crate::protocol::{Command, Response};

pub use self::bridge::Bridge;
pub use self::serial::{DEFAULT_BAUDRATE, SerialTransport};

mod bridge;
#[cfg(test)]
pub(crate) mod mock;
mod serial;

/// Byte-level access to a two-wire bus.
///
/// Addresses are 7-bit. Every call is a complete bus transaction unless group
/// framing is on, in which case the trailing stop is withheld so the next
/// transaction starts with a repeated start.
pub trait Bus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()>;
    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<()>;
    /// Write then read with a repeated start in between.
    fn write_read(&mut self, address: u8, bytes: &[u8], buf: &mut [u8]) -> Result<()>;

    /// Withhold (`true`) or emit (`false`) the stop after each transaction.
    fn set_group(&mut self, enabled: bool) -> Result<()>;
    fn set_frequency(&mut self, hz: u32) -> Result<()>;

    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        (**self).write(address, bytes)
    }

    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn write_read(&mut self, address: u8, bytes: &[u8], buf: &mut [u8]) -> Result<()> {
        (**self).write_read(address, bytes, buf)
    }

    fn set_group(&mut self, enabled: bool) -> Result<()> {
        (**self).set_group(enabled)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        (**self).set_frequency(hz)
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// Length of a transfer as carried in a single count byte.
pub(crate) fn length_byte(address: u8, length: usize) -> Result<u8> {
    u8::try_from(length).map_err(|_| crate::Error::BlockTooLong { address, length })
}

/// Abstraction of the link to a bus adapter.
/// Might be a serial port, or a USB bulk endpoint.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    fn recv_raw(&mut self) -> Result<Vec<u8>>;

    fn transfer(&mut self, id: u8, cmd: Command) -> Result<Response> {
        let req = cmd.into_raw(id)?;
        log::debug!("=> {}", hex::encode(&req));
        self.send_raw(&req)?;

        let resp = self.recv_raw()?;
        log::debug!("<= {}", hex::encode(&resp));
        let (resp_id, resp) = Response::from_raw(&resp)?;
        if resp_id != id {
            return Err(crate::Error::Transport(format!(
                "response id {resp_id} does not match request {id}"
            )));
        }
        Ok(resp)
    }
}
