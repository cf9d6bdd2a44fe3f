//! In-memory bus used by unit tests.
//!
//! Each simulated device keeps a register file keyed by page and command, so
//! writes can be read back. Reads can also be scripted per command to model
//! registers that change between polls.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::Bus;
use crate::constants::{ALERT_RESPONSE_ADDRESS, commands};
use crate::pec::Pec;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Write { address: u8, bytes: Vec<u8> },
    Read { address: u8, len: usize },
    WriteRead { address: u8, bytes: Vec<u8>, len: usize },
    Group(bool),
    Frequency(u32),
    Delay(Duration),
}

#[derive(Debug, Default)]
pub struct Device {
    pub page: u8,
    paged: HashMap<(u8, u8), Vec<u8>>,
    shared: HashMap<u8, Vec<u8>>,
    blocks: HashMap<u8, Vec<u8>>,
    scripted: HashMap<u8, VecDeque<Vec<u8>>>,
    alert_masks: HashMap<u8, u8>,
    nacks: u32,
    refusals: HashMap<u8, u32>,
    bad_pec: bool,
}

impl Device {
    fn lookup(&mut self, command: u8) -> Vec<u8> {
        if let Some(queue) = self.scripted.get_mut(&command) {
            if let Some(value) = queue.pop_front() {
                return value;
            }
        }
        if command == commands::PAGE {
            return vec![self.page];
        }
        self.paged
            .get(&(self.page, command))
            .or_else(|| self.shared.get(&command))
            .cloned()
            .unwrap_or_default()
    }

    fn refused(&mut self, command: u8) -> bool {
        match self.refusals.get_mut(&command) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn store(&mut self, command: u8, body: &[u8]) {
        match command {
            commands::PAGE => {
                if let Some(&page) = body.first() {
                    self.page = page;
                }
            }
            commands::PAGE_PLUS_WRITE if body.len() >= 3 => {
                self.paged.insert((body[1], body[2]), body[3..].to_vec());
            }
            commands::SMBALERT_MASK if body.len() == 2 => {
                self.alert_masks.insert(body[0], body[1]);
            }
            _ if body.is_empty() => (),
            _ => {
                self.paged.insert((self.page, command), body.to_vec());
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MockBus {
    pub ops: Vec<Op>,
    pub devices: BTreeMap<u8, Device>,
    /// Devices expect and append a PEC byte.
    pub pec: bool,
    /// Address returned from the alert response address.
    pub alert: Option<u8>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an idle device at `address`.
    pub fn with_device(mut self, address: u8) -> Self {
        self.add_device(address);
        self
    }

    pub fn add_device(&mut self, address: u8) -> &mut Device {
        self.device(address)
    }

    fn device(&mut self, address: u8) -> &mut Device {
        self.devices.entry(address).or_insert_with(|| {
            let mut device = Device::default();
            // Not busy, nothing pending.
            device.shared.insert(commands::MFR_COMMON, vec![0x60]);
            device
        })
    }

    pub fn set(&mut self, address: u8, command: u8, value: &[u8]) {
        self.device(address).shared.insert(command, value.to_vec());
    }

    pub fn set_word(&mut self, address: u8, command: u8, value: u16) {
        self.set(address, command, &value.to_le_bytes());
    }

    pub fn set_paged(&mut self, address: u8, page: u8, command: u8, value: &[u8]) {
        self.device(address)
            .paged
            .insert((page, command), value.to_vec());
    }

    pub fn set_paged_word(&mut self, address: u8, page: u8, command: u8, value: u16) {
        self.set_paged(address, page, command, &value.to_le_bytes());
    }

    pub fn set_block(&mut self, address: u8, command: u8, data: &[u8]) {
        self.device(address).blocks.insert(command, data.to_vec());
    }

    /// Queues values returned by successive reads of `command`.
    pub fn script(&mut self, address: u8, command: u8, values: &[&[u8]]) {
        let queue = self.device(address).scripted.entry(command).or_default();
        queue.extend(values.iter().map(|v| v.to_vec()));
    }

    /// Makes the next `count` transactions to `address` fail to acknowledge.
    pub fn nack(&mut self, address: u8, count: u32) {
        self.device(address).nacks = count;
    }

    /// Makes the next `count` transactions carrying `command` to `address`
    /// fail to acknowledge.
    pub fn refuse(&mut self, address: u8, command: u8, count: u32) {
        self.device(address).refusals.insert(command, count);
    }

    /// Makes `address` answer reads with a wrong PEC byte.
    pub fn corrupt_pec(&mut self, address: u8) {
        self.device(address).bad_pec = true;
    }

    /// Current register value as written under the active page.
    pub fn value(&self, address: u8, command: u8) -> Option<&[u8]> {
        let device = self.devices.get(&address)?;
        device
            .paged
            .get(&(device.page, command))
            .or_else(|| device.shared.get(&command))
            .map(|v| v.as_slice())
    }

    pub fn paged_value(&self, address: u8, page: u8, command: u8) -> Option<&[u8]> {
        self.devices
            .get(&address)?
            .paged
            .get(&(page, command))
            .map(|v| v.as_slice())
    }

    pub fn page(&self, address: u8) -> Option<u8> {
        self.devices.get(&address).map(|d| d.page)
    }

    /// Every plain write as (address, bytes) in issue order.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { address, bytes } => Some((*address, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Delay(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    fn present(&mut self, address: u8) -> Result<&mut Device> {
        let device = self
            .devices
            .get_mut(&address)
            .ok_or(Error::Nack { address })?;
        if device.nacks > 0 {
            device.nacks -= 1;
            return Err(Error::Nack { address });
        }
        Ok(device)
    }

    fn respond(pec: Option<Pec>, value: &[u8], block: bool, buf: &mut [u8]) {
        buf.fill(0);
        let room = if pec.is_some() { buf.len() - 1 } else { buf.len() };
        let data_len = if block { value.len().min(room) } else { room };
        for (dst, src) in buf.iter_mut().zip(value.iter()).take(data_len) {
            *dst = *src;
        }
        if let Some(mut pec) = pec {
            pec.extend(&buf[..data_len]);
            buf[data_len] = pec.finish();
        }
    }
}

impl Bus for MockBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        self.ops.push(Op::Write {
            address,
            bytes: bytes.to_vec(),
        });
        let pec = self.pec;
        let device = self.present(address)?;
        let Some((&command, mut body)) = bytes.split_first() else {
            return Ok(());
        };
        if device.refused(command) {
            return Err(Error::Nack { address });
        }
        if pec && !body.is_empty() {
            let (payload, check) = bytes.split_at(bytes.len() - 1);
            let mut expected = Pec::write(address);
            expected.extend(payload);
            if expected.finish() != check[0] {
                return Err(Error::Transport("device rejected PEC".into()));
            }
            body = &body[..body.len() - 1];
        }
        device.store(command, body);
        Ok(())
    }

    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<()> {
        self.ops.push(Op::Read {
            address,
            len: buf.len(),
        });
        if address == ALERT_RESPONSE_ADDRESS {
            let alerting = self.alert.ok_or(Error::Nack { address })?;
            buf.fill(0);
            buf[0] = alerting << 1;
            return Ok(());
        }
        self.present(address)?;
        buf.fill(0);
        Ok(())
    }

    fn write_read(&mut self, address: u8, bytes: &[u8], buf: &mut [u8]) -> Result<()> {
        self.ops.push(Op::WriteRead {
            address,
            bytes: bytes.to_vec(),
            len: buf.len(),
        });
        let pec = self.pec.then(|| {
            let mut pec = Pec::write(address);
            pec.extend(bytes);
            pec.restart_read(address);
            pec
        });
        let device = self.present(address)?;
        let command = bytes[0];
        if device.refused(command) {
            return Err(Error::Nack { address });
        }
        let (value, block) = match (command, &bytes[1..]) {
            (commands::PAGE_PLUS_READ, [2, page, inner]) => {
                let data = device
                    .paged
                    .get(&(*page, *inner))
                    .or_else(|| device.shared.get(inner))
                    .cloned()
                    .unwrap_or_default();
                let mut value = vec![data.len() as u8];
                value.extend(data);
                (value, true)
            }
            (commands::SMBALERT_MASK, [1, register]) => {
                let mask = device.alert_masks.get(register).copied().unwrap_or(0);
                (vec![1, mask], true)
            }
            (_, []) => match device.blocks.get(&command).cloned() {
                Some(data) => {
                    let mut value = vec![data.len() as u8];
                    value.extend(data);
                    (value, true)
                }
                None => (device.lookup(command), false),
            },
            _ => (Vec::new(), true),
        };
        let corrupt = pec.is_some() && device.bad_pec;
        Self::respond(pec, &value, block, buf);
        if corrupt {
            if let Some(last) = buf.last_mut() {
                *last ^= 0xff;
            }
        }
        Ok(())
    }

    fn set_group(&mut self, enabled: bool) -> Result<()> {
        self.ops.push(Op::Group(enabled));
        Ok(())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<()> {
        self.ops.push(Op::Frequency(hz));
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.ops.push(Op::Delay(duration));
    }
}
