//! Power system management device registry and per-device helpers.
use std::fmt;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::constants::{ALL_PAGES, RAIL_ADDRESS_DISABLED, SPEED_10K, SPEED_100K, SPEED_400K};
use crate::pmbus::{PageMode, PmBus, Reading, StatusWord};
use crate::rail::Rail;
use crate::transport::Bus;
use crate::{Error, Result};

bitflags! {
    /// Optional telemetry and status a device implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Capabilities: u16 {
        const VOUT = 1 << 0;
        const VIN = 1 << 1;
        const IOUT = 1 << 2;
        const IIN = 1 << 3;
        const POUT = 1 << 4;
        const PIN = 1 << 5;
        const TEMP = 1 << 6;
        /// Duty cycle readback.
        const DC = 1 << 7;
        const STATUS_WORD = 1 << 14;
        const STATUS_EXT = 1 << 15;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Regulates its outputs.
    Controller,
    /// Supervises and sequences external supplies.
    Manager,
}

/// Width of `MFR_CONFIG_ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigWidth {
    Byte,
    Word,
}

/// Device family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub role: Role,
    pub pages: u8,
    pub config_width: ConfigWidth,
    pub description: String,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    /// `MFR_SPECIAL_ID` values with the revision nibble cleared.
    #[serde(deserialize_with = "parse_ids")]
    pub ids: Vec<u16>,
    #[serde(default)]
    pages: Option<u8>,
    #[serde(default)]
    config_width: Option<ConfigWidth>,
    /// Phases report slave status through `MFR_PADS`.
    #[serde(default)]
    shared_phase_pads: bool,
    /// Die temperature lives in `READ_OTEMP` instead of `READ_ITEMP`.
    #[serde(default)]
    otemp_is_internal: bool,
    pub capabilities: Capabilities,
}

/// A registry entry resolved against its family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub family: String,
    pub role: Role,
    pub pages: u8,
    pub config_width: ConfigWidth,
    pub capabilities: Capabilities,
    pub shared_phase_pads: bool,
    pub otemp_is_internal: bool,
    /// Raw `MFR_SPECIAL_ID` as read.
    pub id: u16,
}

impl DeviceInfo {
    /// Telemetry register carrying the die temperature.
    pub fn internal_temperature(&self) -> Reading {
        if self.otemp_is_internal {
            Reading::ExternalTemperature
        } else {
            Reading::InternalTemperature
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.id)
    }
}

pub struct DeviceDb {
    families: Vec<Family>,
}

impl DeviceDb {
    /// The built in tables.
    pub fn load() -> Result<Self> {
        let mut families = parse_families(include_str!("../devices/controllers.yaml"))?;
        families.extend(parse_families(include_str!("../devices/managers.yaml"))?);
        Ok(DeviceDb { families })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(DeviceDb {
            families: parse_families(text)?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Looks up a raw `MFR_SPECIAL_ID`.
    pub fn find(&self, special_id: u16) -> Option<DeviceInfo> {
        let id = special_id & 0xfff0;
        self.families.iter().find_map(|family| {
            let variant = family.variants.iter().find(|v| v.ids.contains(&id))?;
            log::trace!("0x{:04x} is {} ({})", special_id, variant.name, family.name);
            Some(DeviceInfo {
                name: variant.name.clone(),
                family: family.name.clone(),
                role: family.role,
                pages: variant.pages.unwrap_or(family.pages),
                config_width: variant.config_width.unwrap_or(family.config_width),
                capabilities: variant.capabilities,
                shared_phase_pads: variant.shared_phase_pads,
                otemp_is_internal: variant.otemp_is_internal,
                id: special_id,
            })
        })
    }
}

fn parse_families(text: &str) -> Result<Vec<Family>> {
    let mut families = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        families.push(Family::deserialize(document)?);
    }
    Ok(families)
}

fn parse_ids<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ids: Vec<String> = Deserialize::deserialize(deserializer)?;
    ids.into_iter()
        .map(|id| {
            let parsed = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => id.parse(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("bad id {:?}: {}", id, e)))
        })
        .collect()
}

/// A detected device on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    address: u8,
    info: DeviceInfo,
    max_speed: u32,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ 0x{:02x}", self.info, self.address)
    }
}

impl Device {
    pub fn new(address: u8, info: DeviceInfo) -> Self {
        Device {
            address,
            info,
            max_speed: SPEED_100K,
        }
    }

    /// Reads the identity register and resolves it. `None` when the address
    /// does not answer, answers with a bad PEC or holds an unknown part.
    pub fn detect<B: Bus>(pmbus: &mut PmBus<B>, address: u8) -> Result<Option<Self>> {
        let id = match pmbus.read_mfr_special_id(address) {
            Ok(id) => id,
            Err(Error::Nack { .. }) => return Ok(None),
            Err(e @ Error::Pec { .. }) => {
                log::warn!("Skipping 0x{:02x}: {}", address, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match pmbus.registry().find(id) {
            Some(info) => {
                log::debug!("Found {} at 0x{:02x}", info, address);
                Ok(Some(Device::new(address, info)))
            }
            None => {
                log::warn!("Unknown device 0x{:04x} at 0x{:02x}", id, address);
                Ok(None)
            }
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn role(&self) -> Role {
        self.info.role
    }

    pub fn is_controller(&self) -> bool {
        self.info.role == Role::Controller
    }

    pub fn pages(&self) -> u8 {
        self.info.pages
    }

    pub fn capabilities(&self) -> Capabilities {
        self.info.capabilities
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.info.capabilities.contains(capability)
    }

    /// Fastest bus speed found by [`probe_speed`](Self::probe_speed).
    pub fn max_speed(&self) -> u32 {
        self.max_speed
    }

    fn gated<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        capability: Capabilities,
        reading: Reading,
        polling: bool,
    ) -> Result<f32> {
        if !self.has(capability) {
            return Ok(0.0);
        }
        pmbus.read(self.address, PageMode::Current, reading, polling)
    }

    pub fn read_vin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::VIN, Reading::Vin, polling)
    }

    pub fn read_iin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::IIN, Reading::Iin, polling)
    }

    pub fn read_vout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::VOUT, Reading::Vout, polling)
    }

    pub fn read_iout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::IOUT, Reading::Iout, polling)
    }

    pub fn read_pout<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::POUT, Reading::Pout, polling)
    }

    pub fn read_pin<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::PIN, Reading::Pin, polling)
    }

    pub fn read_external_temperature<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        polling: bool,
    ) -> Result<f32> {
        self.gated(pmbus, Capabilities::TEMP, Reading::ExternalTemperature, polling)
    }

    pub fn read_internal_temperature<B: Bus>(
        &self,
        pmbus: &mut PmBus<B>,
        polling: bool,
    ) -> Result<f32> {
        self.gated(
            pmbus,
            Capabilities::TEMP,
            self.info.internal_temperature(),
            polling,
        )
    }

    pub fn read_duty_cycle<B: Bus>(&self, pmbus: &mut PmBus<B>, polling: bool) -> Result<f32> {
        self.gated(pmbus, Capabilities::DC, Reading::DutyCycle, polling)
    }

    pub fn read_status_word<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<StatusWord> {
        if !self.has(Capabilities::STATUS_WORD) {
            return Ok(StatusWord::from(0));
        }
        pmbus.read_status_word(self.address, PageMode::Current)
    }

    pub fn read_special_id<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<u16> {
        pmbus.read_mfr_special_id(self.address)
    }

    pub fn set_vout<B: Bus>(&self, pmbus: &mut PmBus<B>, volts: f32) -> Result<()> {
        if !self.has(Capabilities::VOUT) {
            return Ok(());
        }
        pmbus.set_vout(self.address, volts)
    }

    pub fn set_page<B: Bus>(&self, pmbus: &mut PmBus<B>, page: u8) -> Result<()> {
        pmbus.set_page(self.address, page)
    }

    pub fn margin_high<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        pmbus.margin_high(self.address)
    }

    pub fn margin_low<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        pmbus.margin_low(self.address)
    }

    pub fn margin_off<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        pmbus.margin_off(self.address)
    }

    pub fn clear_faults<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<()> {
        pmbus.clear_faults(self.address)
    }

    pub fn model<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<String> {
        pmbus.read_model(self.address)
    }

    /// Switches the bus to `hz`, enabling clock stretching above 100 kHz.
    pub fn set_speed<B: Bus>(&self, pmbus: &mut PmBus<B>, hz: u32) -> Result<()> {
        pmbus.set_clock_stretch(self.address, hz > SPEED_100K)?;
        pmbus.smbus_mut().set_frequency(hz)
    }

    /// Finds the fastest bus speed at which page writes read back reliably.
    /// Leaves the bus at the last speed tried and returns 0 if none passed.
    pub fn probe_speed<B: Bus>(&mut self, pmbus: &mut PmBus<B>) -> Result<u32> {
        const TRIES: usize = 10;

        self.max_speed = 0;
        for speed in [SPEED_400K, SPEED_100K, SPEED_10K] {
            pmbus.smbus_mut().set_frequency(speed)?;
            if self.page_loopback(pmbus, TRIES)? {
                log::info!("0x{:02x} passes at {} Hz", self.address, speed);
                self.max_speed = speed;
                break;
            }
        }
        Ok(self.max_speed)
    }

    fn page_loopback<B: Bus>(&self, pmbus: &mut PmBus<B>, tries: usize) -> Result<bool> {
        for _ in 0..tries {
            for page in [0, ALL_PAGES] {
                let echoed = pmbus
                    .set_page(self.address, page)
                    .and_then(|_| pmbus.get_page(self.address));
                match echoed {
                    Ok(p) if p == page => (),
                    Ok(_) | Err(Error::Nack { .. }) | Err(Error::Pec { .. }) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    /// Rails driven by this device.
    pub fn rails<B: Bus>(&self, pmbus: &mut PmBus<B>) -> Result<Vec<Rail>> {
        match self.info.role {
            Role::Manager => Ok((0..self.info.pages)
                .map(|page| Rail::from_page(self, self.address, false, page))
                .collect()),
            Role::Controller => {
                let mut rails: Vec<Rail> = Vec::new();
                for page in 0..self.info.pages.min(2) {
                    pmbus.set_page(self.address, page)?;
                    let rail_address = pmbus.get_rail_address(self.address)?;
                    let multiphase =
                        rail_address != RAIL_ADDRESS_DISABLED && rail_address != self.address;
                    if multiphase {
                        if let Some(rail) = rails
                            .iter_mut()
                            .find(|r| r.is_multiphase() && r.address() == rail_address)
                        {
                            rail.push_page(self.address, page);
                            continue;
                        }
                        rails.push(Rail::from_page(self, rail_address, true, page));
                    } else {
                        rails.push(Rail::from_page(self, self.address, false, page));
                    }
                }
                Ok(rails)
            }
        }
    }
}
