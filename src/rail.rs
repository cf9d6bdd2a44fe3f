//! Logical power rails assembled from device pages.
//!
//! A rail is one or more (address, pages) fragments whose outputs are tied
//! together. Telemetry is aggregated across every page of every fragment.
use std::time::Duration;

use crate::constants::{commands, status_vout};
use crate::device::{Capabilities, Device};
use crate::pmbus::{PageMode, PmBus, Reading, Setting, StatusRegister, StatusWord};
use crate::transport::Bus;
use crate::Result;

/// Pages of one device that belong to a rail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub address: u8,
    pub pages: Vec<u8>,
    /// Slave phases flag themselves in `MFR_PADS`.
    pub shared_phase_pads: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rail {
    address: u8,
    multiphase: bool,
    controller: bool,
    capabilities: Capabilities,
    fragments: Vec<Fragment>,
}

const TRANSIENT_STEP: f32 = 0.001;
const TRANSIENT_SETTLE: Duration = Duration::from_millis(50);

impl Rail {
    pub fn new(
        address: u8,
        multiphase: bool,
        controller: bool,
        capabilities: Capabilities,
        fragments: Vec<Fragment>,
    ) -> Self {
        let mut rail = Rail {
            address,
            multiphase,
            controller,
            capabilities,
            fragments,
        };
        rail.normalize();
        rail
    }

    pub(crate) fn from_page(device: &Device, address: u8, multiphase: bool, page: u8) -> Self {
        Rail {
            address,
            multiphase,
            controller: device.is_controller(),
            capabilities: device.capabilities(),
            fragments: vec![Fragment {
                address: device.address(),
                pages: vec![page],
                shared_phase_pads: device.info().shared_phase_pads,
            }],
        }
    }

    /// Rail address for multiphase rails, otherwise the device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_multiphase(&self) -> bool {
        self.multiphase
    }

    pub fn is_controller(&self) -> bool {
        self.controller
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Every (address, page) pair in fragment order.
    pub fn pages(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.fragments
            .iter()
            .flat_map(|f| f.pages.iter().map(move |&p| (f.address, p)))
    }

    pub fn page_count(&self) -> usize {
        self.fragments.iter().map(|f| f.pages.len()).sum()
    }

    pub(crate) fn push_page(&mut self, address: u8, page: u8) {
        match self.fragments.iter_mut().find(|f| f.address == address) {
            Some(fragment) => fragment.pages.push(page),
            None => self.fragments.push(Fragment {
                address,
                pages: vec![page],
                shared_phase_pads: false,
            }),
        }
        self.normalize();
    }

    /// True when `other` drives the same multiphase rail.
    pub fn is_same_rail(&self, other: &Rail) -> bool {
        self.multiphase && other.multiphase && self.address == other.address
    }

    /// Folds `other` into this rail. The result does not depend on the order
    /// rails are merged in.
    pub fn merge(&mut self, other: Rail) {
        self.capabilities &= other.capabilities;
        self.controller |= other.controller;
        for fragment in other.fragments {
            match self
                .fragments
                .iter_mut()
                .find(|f| f.address == fragment.address)
            {
                Some(existing) => {
                    existing.pages.extend(fragment.pages);
                    existing.shared_phase_pads |= fragment.shared_phase_pads;
                }
                None => self.fragments.push(fragment),
            }
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.fragments.sort_by_key(|f| f.address);
        for fragment in &mut self.fragments {
            fragment.pages.sort_unstable();
            fragment.pages.dedup();
        }
    }

    fn first(&self) -> Option<(u8, u8)> {
        self.pages().next()
    }

    /// Where rail wide writes go.
    fn target(&self) -> (u8, PageMode) {
        match (self.multiphase, self.first()) {
            (false, Some((address, page))) => (address, PageMode::Select(page)),
            _ => (self.address, PageMode::Current),
        }
    }

    fn read_first<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        capability: Capabilities,
        reading: Reading,
        polling: bool,
    ) -> Result<f32> {
        match self.first() {
            Some((address, page)) if self.has(capability) => {
                pmbus.read(address, PageMode::Select(page), reading, polling)
            }
            _ => Ok(0.0),
        }
    }

    fn per_page<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        reading: Reading,
        polling: bool,
    ) -> Result<Vec<f32>> {
        let mut values = Vec::with_capacity(self.page_count());
        for (address, page) in self.pages().collect::<Vec<_>>() {
            values.push(pmbus.read(address, PageMode::Select(page), reading, polling)?);
        }
        Ok(values)
    }

    fn sum<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        capability: Capabilities,
        reading: Reading,
        polling: bool,
    ) -> Result<f32> {
        if !self.has(capability) {
            return Ok(0.0);
        }
        Ok(self.per_page(pmbus, reading, polling)?.iter().sum())
    }

    fn average<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        capability: Capabilities,
        reading: Reading,
        polling: bool,
    ) -> Result<f32> {
        if !self.has(capability) {
            return Ok(0.0);
        }
        let values = self.per_page(pmbus, reading, polling)?;
        if values.is_empty() {
            return Ok(0.0);
        }
        Ok(values.iter().sum::<f32>() / values.len() as f32)
    }

    pub fn set_vout<B: Bus>(&self, pmbus: &mut PmBus<B>, volts: f32) -> Result<()> {
        if !self.has(Capabilities::VOUT) {
            return Ok(());
        }
        let (address, mode) = self.target();
        pmbus.set(address, mode, Setting::VoutCommand, volts)
    }

    pub fn read_vin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.read_first(pmbus, Capabilities::VIN, Reading::Vin, polling)
    }

    pub fn read_vout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.read_first(pmbus, Capabilities::VOUT, Reading::Vout, polling)
    }

    pub fn read_iin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.sum(pmbus, Capabilities::IIN, Reading::Iin, polling)
    }

    pub fn read_iout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.sum(pmbus, Capabilities::IOUT, Reading::Iout, polling)
    }

    pub fn read_pout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.sum(pmbus, Capabilities::POUT, Reading::Pout, polling)
    }

    /// Input power is per device, so each fragment counts once.
    pub fn read_pin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        if !self.has(Capabilities::PIN) {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for fragment in &self.fragments {
            total += pmbus.read(fragment.address, PageMode::Current, Reading::Pin, polling)?;
        }
        Ok(total)
    }

    pub fn read_external_temperature<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        polling: bool,
    ) -> Result<f32> {
        self.average(pmbus, Capabilities::TEMP, Reading::ExternalTemperature, polling)
    }

    /// Average die temperature. The register is chosen per fragment from
    /// the part's identity.
    pub fn read_internal_temperature<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        polling: bool,
    ) -> Result<f32> {
        if !self.has(Capabilities::TEMP) || self.page_count() == 0 {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for fragment in &self.fragments {
            let reading = pmbus
                .device_type(fragment.address)?
                .map_or(Reading::InternalTemperature, |info| info.internal_temperature());
            for &page in &fragment.pages {
                total += pmbus.read(fragment.address, PageMode::Select(page), reading, polling)?;
            }
        }
        Ok(total / self.page_count() as f32)
    }

    pub fn read_duty_cycle<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.average(pmbus, Capabilities::DC, Reading::DutyCycle, polling)
    }

    /// Efficiency in percent, from the best pair of input and output
    /// measurements available.
    pub fn read_efficiency<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        let output = if self.has(Capabilities::POUT) {
            Some(self.read_pout(pmbus, polling)?)
        } else if self.has(Capabilities::VOUT | Capabilities::IOUT) {
            Some(self.read_vout(pmbus, polling)? * self.read_iout(pmbus, polling)?)
        } else {
            None
        };
        let Some(output) = output else {
            return Ok(0.0);
        };
        let input = if self.has(Capabilities::PIN) {
            self.read_pin(pmbus, polling)?
        } else if self.has(Capabilities::VIN | Capabilities::IIN) {
            self.read_vin(pmbus, polling)? * self.read_iin(pmbus, polling)?
        } else {
            return Ok(0.0);
        };
        if input == 0.0 {
            return Ok(0.0);
        }
        Ok(100.0 * output / input)
    }

    /// Current spread across phases as a percentage of the total.
    pub fn read_phase_balance<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        if !self.has(Capabilities::IOUT) {
            return Ok(0.0);
        }
        let currents = self.per_page(pmbus, Reading::Iout, polling)?;
        let total: f32 = currents.iter().sum();
        if total == 0.0 {
            return Ok(0.0);
        }
        let max = currents.iter().copied().fold(f32::MIN, f32::max);
        let min = currents.iter().copied().fold(f32::MAX, f32::min);
        Ok(100.0 * (max - min) / total)
    }

    /// Largest distance between VOUT and the UV threshold that trips, over
    /// all active phases.
    ///
    /// Sweeps `VOUT_UV_FAULT_LIMIT` up from 95% of VOUT in 1 mV steps with
    /// the fault response disabled, then restores the limit and response.
    pub fn read_transient<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        let mut worst = 0.0_f32;
        for fragment in &self.fragments {
            for &page in &fragment.pages {
                if self.controller && fragment.shared_phase_pads {
                    let pads = pmbus.read_mfr_pads(fragment.address)?;
                    if pads & (1 << (14 + page as u16)) != 0 {
                        log::debug!("0x{:02x}/{} is a slave phase", fragment.address, page);
                        continue;
                    }
                }
                let margin = self.transient_page(pmbus, fragment.address, page, polling)?;
                worst = worst.max(margin);
            }
        }
        Ok(worst)
    }

    fn transient_page<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        address: u8,
        page: u8,
        polling: bool,
    ) -> Result<f32> {
        let settle = |pmbus: &mut PmBus<B>| -> Result<()> {
            if polling {
                pmbus.wait_for_ack(address, commands::PAGE)?;
                pmbus.wait_for_not_busy(address)?;
            }
            Ok(())
        };

        settle(pmbus)?;
        pmbus.set_page(address, page)?;
        settle(pmbus)?;
        let vout = pmbus.read(address, PageMode::Current, Reading::Vout, polling)?;
        let uv_limit = pmbus.get(address, PageMode::Current, Setting::VoutUvFaultLimit, polling)?;
        settle(pmbus)?;
        let response = pmbus
            .smbus_mut()
            .read_byte(address, commands::VOUT_UV_FAULT_RESPONSE)?;
        pmbus
            .smbus_mut()
            .write_byte(address, commands::VOUT_UV_FAULT_RESPONSE, 0)?;

        let sweep = |pmbus: &mut PmBus<B>| -> Result<f32> {
            settle(pmbus)?;
            self.clear_uv_fault(pmbus, address)?;
            settle(pmbus)?;

            let start = 0.95 * vout;
            let end = 1.05 * vout;
            let steps = ((end - start) / TRANSIENT_STEP).ceil().max(0.0) as u32;
            for step in 0..steps {
                let limit = start + step as f32 * TRANSIENT_STEP;
                pmbus.set(address, PageMode::Current, Setting::VoutUvFaultLimit, limit)?;
                settle(pmbus)?;
                let status = pmbus.read_status(address, PageMode::Current, StatusRegister::Vout)?;
                settle(pmbus)?;
                if status & status_vout::UV_FAULT != 0 {
                    return Ok(limit);
                }
                pmbus.delay(TRANSIENT_SETTLE);
            }
            Ok(end)
        };
        let restore = |pmbus: &mut PmBus<B>| -> Result<()> {
            pmbus.set(address, PageMode::Current, Setting::VoutUvFaultLimit, uv_limit)?;
            settle(pmbus)?;
            pmbus
                .smbus_mut()
                .write_byte(address, commands::VOUT_UV_FAULT_RESPONSE, response)?;
            settle(pmbus)?;
            self.clear_uv_fault(pmbus, address)
        };

        // The limit and response go back even when the sweep fails.
        let swept = sweep(pmbus);
        let restored = restore(pmbus);
        if let Err(e) = &restored {
            log::warn!("0x{:02x}/{} UV settings not restored: {}", address, page, e);
        }
        let tripped = swept?;
        restored?;

        log::debug!(
            "0x{:02x}/{} vout {:.3} trips at {:.3}",
            address,
            page,
            vout,
            tripped
        );
        Ok(vout - tripped)
    }

    /// Controllers clear a status bit by writing it back; managers need
    /// `CLEAR_FAULTS`.
    fn clear_uv_fault<B: Bus>(&self, pmbus: &mut PmBus<B>, address: u8) -> Result<()> {
        if self.controller {
            let status = pmbus.read_status(address, PageMode::Current, StatusRegister::Vout)?;
            pmbus
                .smbus_mut()
                .write_byte(address, commands::STATUS_VOUT, status | status_vout::UV_FAULT)
        } else {
            pmbus.clear_faults(address)
        }
    }

    /// OR of the status words of every page.
    pub fn read_status_word<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<StatusWord> {
        if !self.has(Capabilities::STATUS_WORD) {
            return Ok(StatusWord::from(0));
        }
        let mut combined = 0u16;
        for (address, page) in self.pages().collect::<Vec<_>>() {
            combined |= pmbus.read_status_word(address, PageMode::Select(page))?.raw();
        }
        Ok(StatusWord::from(combined))
    }

    pub fn read_special_id<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<u16> {
        match self.first() {
            Some((address, page)) => {
                pmbus.set_page(address, page)?;
                pmbus.read_mfr_special_id(address)
            }
            None => Ok(0),
        }
    }

    /// Clears every page of every fragment in one group burst.
    pub fn clear_faults<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        pmbus.group(|pmbus| {
            for fragment in &self.fragments {
                pmbus.clear_all_faults(fragment.address)?;
            }
            Ok(())
        })
    }

    fn operation<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        f: impl FnOnce(&mut PmBus<B>, u8) -> Result<()>,
    ) -> Result<()> {
        let (address, mode) = self.target();
        if let PageMode::Select(page) = mode {
            pmbus.set_page(address, page)?;
        }
        f(pmbus, address)
    }

    pub fn sequence_on<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.sequence_on(&[a]))
    }

    pub fn sequence_off<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.sequence_off(&[a]))
    }

    pub fn immediate_off<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.immediate_off(&[a]))
    }

    pub fn margin_high<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.margin_high(a))
    }

    pub fn margin_low<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.margin_low(a))
    }

    pub fn margin_off<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        self.operation(pmbus, |p, a| p.margin_off(a))
    }
}

/// Formats a rail as `0x30 [0x40:0,1 0x41:0,1]`.
impl std::fmt::Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.address)?;
        if self.multiphase {
            write!(f, " multiphase")?;
        }
        write!(f, " [")?;
        for (i, fragment) in self.fragments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let pages: Vec<String> = fragment.pages.iter().map(|p| p.to_string()).collect();
            write!(f, "0x{:02x}:{}", fragment.address, pages.join(","))?;
        }
        write!(f, "]")
    }
}
