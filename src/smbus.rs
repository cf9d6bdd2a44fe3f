//! SMBus transactions on top of a raw [`Bus`].
//!
//! Adds optional Packet Error Code framing, block transfers, address probing
//! and the group command queue.
use std::time::{Duration, Instant};

use crate::constants::{
    ALERT_RESPONSE_ADDRESS, DEFAULT_ACK_ATTEMPTS, DEFAULT_NOT_BUSY_ATTEMPTS, DEFAULT_NVM_ATTEMPTS,
    GLOBAL_ADDRESS, PROBE_FIRST, PROBE_LAST,
};
use crate::pec::Pec;
use crate::transport::{Bus, length_byte};
use crate::{Error, Result};

/// Addresses skipped by [`SmBus::probe_unique`] on top of the alert address.
const NON_UNIQUE: [u8; 3] = [0x5a, GLOBAL_ADDRESS, 0x7c];

/// Ceilings for the busy-wait loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub ack_attempts: u32,
    pub not_busy_attempts: u32,
    pub nvm_attempts: u32,
    /// Wall-clock bound on any single wait, checked between attempts.
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            ack_attempts: DEFAULT_ACK_ATTEMPTS,
            not_busy_attempts: DEFAULT_NOT_BUSY_ATTEMPTS,
            nvm_attempts: DEFAULT_NVM_ATTEMPTS,
            deadline: None,
        }
    }
}

/// One bounded wait.
pub(crate) struct Poll {
    remaining: u32,
    until: Option<Instant>,
}

impl Poll {
    pub(crate) fn new(attempts: u32, deadline: Option<Duration>) -> Self {
        Poll {
            remaining: attempts,
            until: deadline.map(|d| Instant::now() + d),
        }
    }

    /// Consumes one attempt, false once the budget is spent.
    pub(crate) fn attempt(&mut self) -> bool {
        if self.remaining == 0 || self.until.is_some_and(|t| Instant::now() >= t) {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

pub struct SmBus<B: Bus> {
    bus: B,
    pec: bool,
    poll: PollConfig,
    /// Framed writes captured while a group is being built.
    queue: Option<Vec<(u8, Vec<u8>)>>,
}

impl<B: Bus> SmBus<B> {
    pub fn new(bus: B) -> Self {
        SmBus {
            bus,
            pec: false,
            poll: PollConfig::default(),
            queue: None,
        }
    }

    pub fn with_pec_enabled(bus: B) -> Self {
        let mut smbus = Self::new(bus);
        smbus.pec = true;
        smbus
    }

    pub fn pec(&self) -> bool {
        self.pec
    }

    pub fn set_pec(&mut self, enabled: bool) {
        self.pec = enabled;
    }

    /// Runs `f` with PEC framing forced on or off, restoring the mode after.
    pub fn with_pec<T>(&mut self, enabled: bool, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.pec;
        self.pec = enabled;
        let out = f(self);
        self.pec = saved;
        out
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    pub fn set_poll_config(&mut self, poll: PollConfig) {
        self.poll = poll;
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    pub fn set_frequency(&mut self, hz: u32) -> Result<()> {
        self.bus.set_frequency(hz)
    }

    pub fn delay(&mut self, duration: Duration) {
        self.bus.delay(duration)
    }

    fn frame(&self, address: u8, mut bytes: Vec<u8>) -> Vec<u8> {
        if self.pec {
            let mut pec = Pec::write(address);
            pec.extend(&bytes);
            bytes.push(pec.finish());
        }
        bytes
    }

    fn submit(&mut self, address: u8, bytes: Vec<u8>) -> Result<()> {
        let framed = self.frame(address, bytes);
        match self.queue.as_mut() {
            Some(queue) => {
                queue.push((address, framed));
                Ok(())
            }
            None => self.bus.write(address, &framed),
        }
    }

    fn check(&self, address: u8, command: u8, mut pec: Pec, data: &[u8], actual: u8) -> Result<()> {
        pec.extend(data);
        let expected = pec.finish();
        if expected != actual {
            log::warn!(
                "PEC mismatch from 0x{:02x} cmd 0x{:02x}: {:02x} != {:02x}",
                address,
                command,
                actual,
                expected
            );
            return Err(Error::Pec {
                address,
                command,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn read_fixed<const N: usize>(&mut self, address: u8, command: u8) -> Result<[u8; N]> {
        let mut buf = vec![0u8; N + self.pec as usize];
        self.bus.write_read(address, &[command], &mut buf)?;
        if self.pec {
            let mut pec = Pec::write(address);
            pec.push(command);
            pec.restart_read(address);
            self.check(address, command, pec, &buf[..N], buf[N])?;
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&buf[..N]);
        Ok(out)
    }

    pub fn write_byte(&mut self, address: u8, command: u8, data: u8) -> Result<()> {
        self.submit(address, vec![command, data])
    }

    /// Write-byte to every (address, command, data) triple in order.
    pub fn write_bytes(&mut self, writes: &[(u8, u8, u8)]) -> Result<()> {
        for &(address, command, data) in writes {
            self.write_byte(address, command, data)?;
        }
        Ok(())
    }

    pub fn write_word(&mut self, address: u8, command: u8, data: u16) -> Result<()> {
        let [lo, hi] = data.to_le_bytes();
        self.submit(address, vec![command, lo, hi])
    }

    pub fn write_block(&mut self, address: u8, command: u8, data: &[u8]) -> Result<()> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(command);
        bytes.push(length_byte(address, data.len())?);
        bytes.extend_from_slice(data);
        self.submit(address, bytes)
    }

    pub fn send_byte(&mut self, address: u8, command: u8) -> Result<()> {
        self.submit(address, vec![command])
    }

    pub fn read_byte(&mut self, address: u8, command: u8) -> Result<u8> {
        let [b] = self.read_fixed::<1>(address, command)?;
        Ok(b)
    }

    pub fn read_word(&mut self, address: u8, command: u8) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>(address, command)?))
    }

    /// Block read of at most `max` bytes.
    ///
    /// Returns nothing while a group is queued, reads cannot be deferred.
    pub fn read_block(&mut self, address: u8, command: u8, max: usize) -> Result<Vec<u8>> {
        if self.queue.is_some() {
            return Ok(Vec::new());
        }
        let mut pec = Pec::write(address);
        pec.push(command);
        pec.restart_read(address);
        self.block_in(address, command, &[command], pec, max)
    }

    /// Block write followed by a block read in one transaction.
    pub fn write_read_block(
        &mut self,
        address: u8,
        command: u8,
        out: &[u8],
        max: usize,
    ) -> Result<Vec<u8>> {
        if self.queue.is_some() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::with_capacity(2 + out.len());
        bytes.push(command);
        bytes.push(length_byte(address, out.len())?);
        bytes.extend_from_slice(out);

        let mut pec = Pec::write(address);
        pec.extend(&bytes);
        pec.restart_read(address);
        self.block_in(address, command, &bytes, pec, max)
    }

    fn block_in(
        &mut self,
        address: u8,
        command: u8,
        request: &[u8],
        pec: Pec,
        max: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 1 + max + self.pec as usize];
        self.bus.write_read(address, request, &mut buf)?;
        let count = buf[0] as usize;
        if count > max {
            return Err(Error::BlockLength {
                address,
                command,
                reported: count,
                capacity: max,
            });
        }
        if self.pec {
            self.check(address, command, pec, &buf[..1 + count], buf[1 + count])?;
        }
        Ok(buf[1..1 + count].to_vec())
    }

    /// Polls with plain read-byte until the device acknowledges.
    pub fn wait_for_ack(&mut self, address: u8, command: u8) -> Result<()> {
        let mut poll = Poll::new(self.poll.ack_attempts, self.poll.deadline);
        let mut buf = [0u8; 1];
        while poll.attempt() {
            match self.bus.write_read(address, &[command], &mut buf) {
                Ok(()) => return Ok(()),
                Err(Error::Nack { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Timeout {
            address,
            what: "acknowledge",
        })
    }

    /// Addresses in the probe range that acknowledge `command`.
    pub fn probe(&mut self, command: u8) -> Result<Vec<u8>> {
        self.scan(command, &[])
    }

    /// Like [`probe`](Self::probe) but skips addresses shared by many devices.
    pub fn probe_unique(&mut self, command: u8) -> Result<Vec<u8>> {
        self.scan(command, &NON_UNIQUE)
    }

    fn scan(&mut self, command: u8, skip: &[u8]) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for address in PROBE_FIRST..PROBE_LAST {
            if address == ALERT_RESPONSE_ADDRESS || skip.contains(&address) {
                continue;
            }
            match self.bus.write(address, &[command]) {
                Ok(()) => found.push(address),
                Err(Error::Nack { .. }) => (),
                Err(e) => return Err(e),
            }
        }
        log::debug!("probe 0x{:02x} found {:02x?}", command, found);
        Ok(found)
    }

    /// Address of the device pulling SMBALERT low, if any.
    pub fn read_alert(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.bus.read(ALERT_RESPONSE_ADDRESS, &mut buf) {
            Ok(()) => Ok(Some(buf[0] >> 1)),
            Err(Error::Nack { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Starts capturing writes for a group command.
    pub fn begin_queue(&mut self) -> Result<()> {
        match &self.queue {
            Some(queue) if !queue.is_empty() => Err(Error::QueuePending),
            _ => {
                self.queue = Some(Vec::new());
                Ok(())
            }
        }
    }

    /// Drops the captured writes without sending any of them.
    pub fn abort_queue(&mut self) {
        if let Some(queue) = self.queue.take() {
            if !queue.is_empty() {
                log::warn!("dropping {} queued group commands", queue.len());
            }
        }
    }

    pub fn is_queuing(&self) -> bool {
        self.queue.is_some()
    }

    /// Replays the captured writes back to back, ending with a single stop.
    pub fn execute(&mut self) -> Result<()> {
        let Some(queue) = self.queue.take() else {
            return Ok(());
        };
        if queue.is_empty() {
            return Ok(());
        }
        log::debug!("group of {} commands", queue.len());
        self.bus.set_group(true)?;
        let last = queue.len() - 1;
        for (i, (address, bytes)) in queue.into_iter().enumerate() {
            if i == last {
                self.bus.set_group(false)?;
            }
            if let Err(e) = self.bus.write(address, &bytes) {
                if i != last {
                    self.bus.set_group(false)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::commands;
    use crate::transport::mock::{MockBus, Op};

    fn pec_of(bytes: &[u8]) -> u8 {
        crate::pec::checksum(bytes)
    }

    #[test]
    fn write_word_is_little_endian() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x40));
        smbus.write_word(0x40, commands::VOUT_COMMAND, 0x1234).unwrap();
        assert_eq!(smbus.bus().writes(), vec![(0x40, vec![0x21, 0x34, 0x12])]);
    }

    #[test]
    fn write_byte_appends_pec() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.pec = true;
        let mut smbus = SmBus::with_pec_enabled(mock);
        smbus.write_byte(0x40, commands::OPERATION, 0x80).unwrap();
        let expected = pec_of(&[0x80, 0x01, 0x80]);
        assert_eq!(smbus.bus().writes(), vec![(0x40, vec![0x01, 0x80, expected])]);
    }

    #[test]
    fn send_byte_with_pec() {
        let mut mock = MockBus::new().with_device(0x5b);
        mock.pec = true;
        let mut smbus = SmBus::with_pec_enabled(mock);
        smbus.send_byte(0x5b, commands::CLEAR_FAULTS).unwrap();
        assert_eq!(smbus.bus().writes(), vec![(0x5b, vec![0x03, 0x38])]);
    }

    #[test]
    fn block_write_carries_length() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x30));
        smbus.write_block(0x30, 0x05, &[1, 0x21, 0x00, 0x20]).unwrap();
        assert_eq!(
            smbus.bus().writes(),
            vec![(0x30, vec![0x05, 4, 1, 0x21, 0x00, 0x20])]
        );
    }

    #[test]
    fn block_longer_than_count_byte_rejected() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x30));
        let data = [0u8; 256];
        assert!(matches!(
            smbus.write_block(0x30, 0x05, &data),
            Err(Error::BlockTooLong {
                address: 0x30,
                length: 256
            })
        ));
        assert!(matches!(
            smbus.write_read_block(0x30, 0x05, &data, 4),
            Err(Error::BlockTooLong { .. })
        ));
        assert!(smbus.bus().ops.is_empty());
    }

    #[test]
    fn read_word_checks_pec() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.set_word(0x40, commands::READ_VOUT, 0x1234);
        mock.pec = true;
        let mut smbus = SmBus::with_pec_enabled(mock);
        assert_eq!(smbus.read_word(0x40, commands::READ_VOUT).unwrap(), 0x1234);
    }

    #[test]
    fn read_word_pec_mismatch() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.set_word(0x40, commands::READ_VOUT, 0x1234);
        // Device sends no PEC so the host sees a zero check byte.
        let mut smbus = SmBus::with_pec_enabled(mock);
        let err = smbus.read_word(0x40, commands::READ_VOUT).unwrap_err();
        assert!(matches!(
            err,
            Error::Pec {
                address: 0x40,
                command: 0x8b,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn read_block_trims_to_count() {
        let mut mock = MockBus::new().with_device(0x4e);
        mock.set_block(0x4e, commands::MFR_MODEL, b"LTC3880");
        mock.pec = true;
        let mut smbus = SmBus::with_pec_enabled(mock);
        let model = smbus.read_block(0x4e, commands::MFR_MODEL, 8).unwrap();
        assert_eq!(model, b"LTC3880");
    }

    #[test]
    fn read_block_too_long() {
        let mut mock = MockBus::new().with_device(0x4e);
        mock.set_block(0x4e, commands::MFR_MODEL, b"LTC3880-1");
        let mut smbus = SmBus::new(mock);
        assert!(matches!(
            smbus.read_block(0x4e, commands::MFR_MODEL, 4),
            Err(Error::BlockLength { reported: 9, .. })
        ));
    }

    #[test]
    fn write_read_block_page_plus() {
        let mut mock = MockBus::new().with_device(0x4f);
        mock.set_paged_word(0x4f, 1, commands::READ_VOUT, 0x0800);
        mock.pec = true;
        let mut smbus = SmBus::with_pec_enabled(mock);
        let data = smbus
            .write_read_block(0x4f, commands::PAGE_PLUS_READ, &[1, commands::READ_VOUT], 2)
            .unwrap();
        assert_eq!(data, [0x00, 0x08]);
        assert_eq!(
            smbus.bus().ops,
            vec![Op::WriteRead {
                address: 0x4f,
                bytes: vec![0x06, 2, 1, 0x8b],
                len: 4
            }]
        );
    }

    #[test]
    fn wait_for_ack_after_nacks() {
        let mut mock = MockBus::new().with_device(0x20);
        mock.nack(0x20, 3);
        let mut smbus = SmBus::new(mock);
        smbus.wait_for_ack(0x20, 0x00).unwrap();
        assert_eq!(smbus.bus().ops.len(), 4);
    }

    #[test]
    fn wait_for_ack_gives_up() {
        let mut smbus = SmBus::new(MockBus::new());
        smbus.set_poll_config(PollConfig {
            ack_attempts: 16,
            ..PollConfig::default()
        });
        assert!(matches!(
            smbus.wait_for_ack(0x20, 0x00),
            Err(Error::Timeout { address: 0x20, .. })
        ));
        assert_eq!(smbus.bus().ops.len(), 16);
    }

    #[test]
    fn probe_skips_reserved_addresses() {
        let mut mock = MockBus::new();
        for address in [0x0c, 0x10, 0x40, 0x5a, 0x5b, 0x7c, 0x7e] {
            mock.add_device(address);
        }
        let mut smbus = SmBus::new(mock);
        assert_eq!(smbus.probe(0x00).unwrap(), [0x10, 0x40, 0x5a, 0x5b, 0x7c, 0x7e]);
        assert_eq!(smbus.probe_unique(0x00).unwrap(), [0x10, 0x40, 0x7e]);
    }

    #[test]
    fn alert_response() {
        let mut mock = MockBus::new();
        let mut smbus = SmBus::new(&mut mock);
        assert_eq!(smbus.read_alert().unwrap(), None);
        drop(smbus);
        mock.alert = Some(0x4f);
        let mut smbus = SmBus::new(&mut mock);
        assert_eq!(smbus.read_alert().unwrap(), Some(0x4f));
    }

    #[test]
    fn group_defers_writes_not_reads() {
        let mut mock = MockBus::new().with_device(0x40).with_device(0x41);
        mock.set(0x41, commands::STATUS_BYTE, &[0x02]);
        let mut smbus = SmBus::new(mock);

        smbus.begin_queue().unwrap();
        smbus.write_byte(0x40, commands::OPERATION, 0x80).unwrap();
        smbus.send_byte(0x41, commands::CLEAR_FAULTS).unwrap();
        assert_eq!(smbus.read_byte(0x41, commands::STATUS_BYTE).unwrap(), 0x02);
        assert!(
            smbus
                .read_block(0x41, commands::MFR_MODEL, 8)
                .unwrap()
                .is_empty()
        );
        assert!(smbus.bus().writes().is_empty());

        smbus.execute().unwrap();
        assert!(!smbus.is_queuing());
        let ops: Vec<_> = smbus
            .bus()
            .ops
            .iter()
            .filter(|op| !matches!(op, Op::WriteRead { .. }))
            .cloned()
            .collect();
        assert_eq!(
            ops,
            vec![
                Op::Group(true),
                Op::Write {
                    address: 0x40,
                    bytes: vec![0x01, 0x80]
                },
                Op::Group(false),
                Op::Write {
                    address: 0x41,
                    bytes: vec![0x03]
                },
            ]
        );
    }

    #[test]
    fn begin_queue_twice_is_rejected() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x40));
        smbus.begin_queue().unwrap();
        smbus.begin_queue().unwrap();
        smbus.send_byte(0x40, commands::CLEAR_FAULTS).unwrap();
        assert!(matches!(smbus.begin_queue(), Err(Error::QueuePending)));
        smbus.execute().unwrap();
        smbus.begin_queue().unwrap();
    }

    #[test]
    fn abort_discards_queue() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x40));
        smbus.begin_queue().unwrap();
        smbus.send_byte(0x40, commands::CLEAR_FAULTS).unwrap();
        smbus.abort_queue();
        assert!(!smbus.is_queuing());
        smbus.execute().unwrap();
        assert!(smbus.bus().ops.is_empty());

        smbus.write_byte(0x40, commands::OPERATION, 0x80).unwrap();
        assert_eq!(smbus.bus().writes(), vec![(0x40, vec![0x01, 0x80])]);
        smbus.begin_queue().unwrap();
    }

    #[test]
    fn execute_empty_is_noop() {
        let mut smbus = SmBus::new(MockBus::new());
        smbus.begin_queue().unwrap();
        smbus.execute().unwrap();
        smbus.execute().unwrap();
        assert!(smbus.bus().ops.is_empty());
    }

    #[test]
    fn with_pec_restores_mode() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x40));
        smbus.with_pec(true, |s| s.send_byte(0x40, commands::CLEAR_FAULTS)).unwrap();
        assert!(!smbus.pec());
        assert_eq!(smbus.bus().writes()[0].1.len(), 2);
    }
}
