//! [`Bus`] on top of the I2C bridge control protocol.
use super::{Bus, Transport, length_byte};
use crate::protocol::{Command, Response, error_codes};
use crate::{Error, Result};

pub struct Bridge<T: Transport> {
    transport: T,
    next_id: u8,
    group_warned: bool,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: T) -> Self {
        Bridge {
            transport,
            next_id: 0,
            group_warned: false,
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn call(&mut self, address: u8, cmd: Command) -> Result<Vec<u8>> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        match self.transport.transfer(id, cmd)? {
            Response::Ok(data) => Ok(data),
            Response::Err(error_codes::TIMEOUT, _) => Err(Error::Nack { address }),
            Response::Err(code, msg) => Err(Error::Transport(format!(
                "bridge error 0x{:02x} {}",
                code,
                String::from_utf8_lossy(&msg)
            ))),
        }
    }

    fn fill(address: u8, data: Vec<u8>, buf: &mut [u8]) -> Result<()> {
        if data.len() != buf.len() {
            log::debug!(
                "short read from 0x{:02x}: {} of {} bytes",
                address,
                data.len(),
                buf.len()
            );
            return Err(Error::Transport(format!(
                "expected {} bytes, got {}",
                buf.len(),
                data.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }
}

impl<T: Transport> Bus for Bridge<T> {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        self.call(address, Command::write(address, bytes))?;
        Ok(())
    }

    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<()> {
        let data = self.call(address, Command::read(address, length_byte(address, buf.len())?))?;
        Self::fill(address, data, buf)
    }

    fn write_read(&mut self, address: u8, bytes: &[u8], buf: &mut [u8]) -> Result<()> {
        let len = length_byte(address, buf.len())?;
        let data = self.call(address, Command::write_read(address, bytes, len))?;
        Self::fill(address, data, buf)
    }

    fn set_group(&mut self, enabled: bool) -> Result<()> {
        // The bridge always ends a transaction with a stop.
        if enabled && !self.group_warned {
            log::debug!("bridge has no repeated start, group commands are sent back to back");
            self.group_warned = true;
        }
        Ok(())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        self.call(0, Command::SetFrequency { hz })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Transport that answers from a canned list and keeps what was sent.
    #[derive(Default)]
    struct Canned {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl Transport for Canned {
        fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
            self.sent.push(raw.to_vec());
            Ok(())
        }

        fn recv_raw(&mut self) -> Result<Vec<u8>> {
            self.replies
                .pop_front()
                .ok_or_else(|| Error::Transport("no reply".into()))
        }
    }

    #[test]
    fn write_read_returns_payload() {
        let mut canned = Canned::default();
        canned.replies.push_back(vec![0x02, 0x00, 0x00, 0x34, 0x12]);
        let mut bridge = Bridge::new(canned);

        let mut buf = [0u8; 2];
        bridge.write_read(0x40, &[0x8b], &mut buf).unwrap();
        assert_eq!(buf, [0x34, 0x12]);
        assert_eq!(
            bridge.into_inner().sent,
            vec![vec![0x09, 0x00, 0x00, 0x00, 0x05, 0x40, 0x40, 0x8b, 0x02]]
        );
    }

    #[test]
    fn timeout_is_nack() {
        let mut canned = Canned::default();
        canned.replies.push_back(vec![0x02, 0x00, 0x00, 0xff, 0x10]);
        let mut bridge = Bridge::new(canned);
        assert!(matches!(
            bridge.write(0x33, &[0x03]),
            Err(Error::Nack { address: 0x33 })
        ));
    }

    #[test]
    fn mismatched_id_rejected() {
        let mut canned = Canned::default();
        canned.replies.push_back(vec![0x00, 0x00, 0x05]);
        let mut bridge = Bridge::new(canned);
        assert!(matches!(bridge.write(0x33, &[0x03]), Err(Error::Transport(_))));
    }

    #[test]
    fn oversized_read_rejected() {
        let mut bridge = Bridge::new(Canned::default());
        let mut buf = [0u8; 256];
        assert!(matches!(
            bridge.write_read(0x40, &[0x9a], &mut buf),
            Err(Error::BlockTooLong {
                address: 0x40,
                length: 256
            })
        ));
        assert!(bridge.into_inner().sent.is_empty());
    }

    #[test]
    fn ids_advance() {
        let mut canned = Canned::default();
        canned.replies.push_back(vec![0x00, 0x00, 0x00]);
        canned.replies.push_back(vec![0x00, 0x00, 0x01]);
        let mut bridge = Bridge::new(canned);
        bridge.write(0x10, &[0x00]).unwrap();
        bridge.set_frequency(100_000).unwrap();
        let sent = bridge.into_inner().sent;
        assert_eq!(sent[0][2], 0);
        assert_eq!(sent[1][2], 1);
    }
}
