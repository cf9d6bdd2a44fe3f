//! PMBus command layer.
//!
//! Maps named commands onto SMBus transactions, converting engineering units
//! through the LINEAR11/LINEAR16 formats. Page scoped commands take a
//! [`PageMode`] that says how the page is addressed.
use std::time::Duration;

use bitfield::bitfield;

use crate::constants::{
    ALL_PAGES, GLOBAL_ADDRESS, commands, config_all, mfr_common, nvm_key, operation,
    status_byte, status_cml, write_protect, EEPROM_STATUS_BUSY_MASK,
};
use crate::device::{ConfigWidth, DeviceDb, DeviceInfo, Role};
use crate::math;
use crate::smbus::{Poll, SmBus};
use crate::transport::Bus;
use crate::{Error, Result};

/// How a page scoped command reaches its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageMode {
    /// Whatever page the device has selected.
    Current,
    /// Write `PAGE` first.
    Select(u8),
    /// Wrap the command in `PAGE_PLUS_WRITE`/`PAGE_PLUS_READ`.
    Plus(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Linear11,
    /// Exponent taken from `VOUT_MODE`.
    Linear16,
}

/// Limits, set points and timings written as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    VoutCommand,
    VoutMax,
    VoutMarginHigh,
    VoutMarginLow,
    VoutOvFaultLimit,
    VoutOvWarnLimit,
    VoutUvWarnLimit,
    VoutUvFaultLimit,
    IoutOcFaultLimit,
    IoutOcWarnLimit,
    IinOcWarnLimit,
    VinOvFaultLimit,
    VinOvWarnLimit,
    VinUvWarnLimit,
    VinUvFaultLimit,
    OtFaultLimit,
    OtWarnLimit,
    UtWarnLimit,
    UtFaultLimit,
    TonDelay,
    TonRise,
    TonMaxFaultLimit,
    ToffDelay,
    ToffFall,
    ToffMaxWarnLimit,
    WatchdogFirst,
    Watchdog,
}

impl Setting {
    pub const fn command(self) -> u8 {
        use Setting::*;
        match self {
            VoutCommand => commands::VOUT_COMMAND,
            VoutMax => commands::VOUT_MAX,
            VoutMarginHigh => commands::VOUT_MARGIN_HIGH,
            VoutMarginLow => commands::VOUT_MARGIN_LOW,
            VoutOvFaultLimit => commands::VOUT_OV_FAULT_LIMIT,
            VoutOvWarnLimit => commands::VOUT_OV_WARN_LIMIT,
            VoutUvWarnLimit => commands::VOUT_UV_WARN_LIMIT,
            VoutUvFaultLimit => commands::VOUT_UV_FAULT_LIMIT,
            IoutOcFaultLimit => commands::IOUT_OC_FAULT_LIMIT,
            IoutOcWarnLimit => commands::IOUT_OC_WARN_LIMIT,
            IinOcWarnLimit => commands::IIN_OC_WARN_LIMIT,
            VinOvFaultLimit => commands::VIN_OV_FAULT_LIMIT,
            VinOvWarnLimit => commands::VIN_OV_WARN_LIMIT,
            VinUvWarnLimit => commands::VIN_UV_WARN_LIMIT,
            VinUvFaultLimit => commands::VIN_UV_FAULT_LIMIT,
            OtFaultLimit => commands::OT_FAULT_LIMIT,
            OtWarnLimit => commands::OT_WARN_LIMIT,
            UtWarnLimit => commands::UT_WARN_LIMIT,
            UtFaultLimit => commands::UT_FAULT_LIMIT,
            TonDelay => commands::TON_DELAY,
            TonRise => commands::TON_RISE,
            TonMaxFaultLimit => commands::TON_MAX_FAULT_LIMIT,
            ToffDelay => commands::TOFF_DELAY,
            ToffFall => commands::TOFF_FALL,
            ToffMaxWarnLimit => commands::TOFF_MAX_WARN_LIMIT,
            WatchdogFirst => commands::MFR_WATCHDOG_T_FIRST,
            Watchdog => commands::MFR_WATCHDOG_T,
        }
    }

    pub const fn format(self) -> Format {
        use Setting::*;
        match self {
            VoutCommand | VoutMax | VoutMarginHigh | VoutMarginLow | VoutOvFaultLimit
            | VoutOvWarnLimit | VoutUvWarnLimit | VoutUvFaultLimit => Format::Linear16,
            _ => Format::Linear11,
        }
    }
}

/// Telemetry registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reading {
    Vin,
    Iin,
    Vout,
    Iout,
    Pout,
    Pin,
    /// `READ_OTEMP`, the internal die on LTC297x managers.
    ExternalTemperature,
    InternalTemperature,
    DutyCycle,
}

impl Reading {
    pub const fn command(self) -> u8 {
        match self {
            Reading::Vin => commands::READ_VIN,
            Reading::Iin => commands::READ_IIN,
            Reading::Vout => commands::READ_VOUT,
            Reading::Iout => commands::READ_IOUT,
            Reading::Pout => commands::READ_POUT,
            Reading::Pin => commands::READ_PIN,
            Reading::ExternalTemperature => commands::READ_OTEMP,
            Reading::InternalTemperature => commands::READ_ITEMP,
            Reading::DutyCycle => commands::READ_DUTY_CYCLE,
        }
    }

    pub const fn format(self) -> Format {
        match self {
            Reading::Vout => Format::Linear16,
            _ => Format::Linear11,
        }
    }
}

/// Byte wide status registers behind `STATUS_WORD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusRegister {
    Vout,
    Iout,
    Input,
    Temperature,
    Cml,
    Mfr,
}

impl StatusRegister {
    pub const fn command(self) -> u8 {
        match self {
            StatusRegister::Vout => commands::STATUS_VOUT,
            StatusRegister::Iout => commands::STATUS_IOUT,
            StatusRegister::Input => commands::STATUS_INPUT,
            StatusRegister::Temperature => commands::STATUS_TEMP,
            StatusRegister::Cml => commands::STATUS_CML,
            StatusRegister::Mfr => commands::STATUS_MFR_SPECIFIC,
        }
    }
}

bitfield! {
    /// `STATUS_WORD`, low byte is `STATUS_BYTE`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord(u16);
    impl Debug;
    pub none_of_the_above, _: 0;
    pub cml, _: 1;
    pub temperature, _: 2;
    pub vin_uv, _: 3;
    pub iout_oc, _: 4;
    pub vout_ov, _: 5;
    pub off, _: 6;
    pub busy, _: 7;
    pub unknown, _: 8;
    pub other, _: 9;
    pub fans, _: 10;
    pub power_good_n, _: 11;
    pub mfr, _: 12;
    pub input, _: 13;
    pub iout_pout, _: 14;
    pub vout, _: 15;
}

impl From<u16> for StatusWord {
    fn from(raw: u16) -> Self {
        StatusWord(raw)
    }
}

impl StatusWord {
    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn is_clear(&self) -> bool {
        self.0 == 0
    }
}

/// Margins as fractions of the set point, e.g. `0.05` for five percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Supervision {
    pub margin: f32,
    pub warn: f32,
    pub fault: f32,
}

pub struct PmBus<B: Bus> {
    smbus: SmBus<B>,
    registry: DeviceDb,
}

impl<B: Bus> PmBus<B> {
    /// Uses the built in device registry.
    pub fn new(smbus: SmBus<B>) -> Result<Self> {
        Ok(Self::with_registry(smbus, DeviceDb::load()?))
    }

    pub fn with_registry(smbus: SmBus<B>, registry: DeviceDb) -> Self {
        PmBus { smbus, registry }
    }

    pub fn smbus(&self) -> &SmBus<B> {
        &self.smbus
    }

    pub fn smbus_mut(&mut self) -> &mut SmBus<B> {
        &mut self.smbus
    }

    pub fn into_inner(self) -> SmBus<B> {
        self.smbus
    }

    pub fn registry(&self) -> &DeviceDb {
        &self.registry
    }

    // Page plumbing

    fn write_byte_paged(&mut self, address: u8, mode: PageMode, command: u8, data: u8) -> Result<()> {
        match mode {
            PageMode::Current => self.smbus.write_byte(address, command, data),
            PageMode::Select(page) => {
                self.set_page(address, page)?;
                self.smbus.write_byte(address, command, data)
            }
            PageMode::Plus(page) => {
                self.smbus
                    .write_block(address, commands::PAGE_PLUS_WRITE, &[page, command, data])
            }
        }
    }

    fn write_word_paged(&mut self, address: u8, mode: PageMode, command: u8, data: u16) -> Result<()> {
        let [lo, hi] = data.to_le_bytes();
        match mode {
            PageMode::Current => self.smbus.write_word(address, command, data),
            PageMode::Select(page) => {
                self.set_page(address, page)?;
                self.smbus.write_word(address, command, data)
            }
            PageMode::Plus(page) => {
                self.smbus
                    .write_block(address, commands::PAGE_PLUS_WRITE, &[page, command, lo, hi])
            }
        }
    }

    fn read_byte_paged(&mut self, address: u8, mode: PageMode, command: u8) -> Result<u8> {
        match mode {
            PageMode::Current => self.smbus.read_byte(address, command),
            PageMode::Select(page) => {
                self.set_page(address, page)?;
                self.smbus.read_byte(address, command)
            }
            PageMode::Plus(page) => {
                let data = self.smbus.write_read_block(
                    address,
                    commands::PAGE_PLUS_READ,
                    &[page, command],
                    1,
                )?;
                Ok(data.first().copied().unwrap_or_default())
            }
        }
    }

    fn read_word_paged(&mut self, address: u8, mode: PageMode, command: u8) -> Result<u16> {
        match mode {
            PageMode::Current => self.smbus.read_word(address, command),
            PageMode::Select(page) => {
                self.set_page(address, page)?;
                self.smbus.read_word(address, command)
            }
            PageMode::Plus(page) => {
                let data = self.smbus.write_read_block(
                    address,
                    commands::PAGE_PLUS_READ,
                    &[page, command],
                    2,
                )?;
                let mut word = [0u8; 2];
                for (dst, src) in word.iter_mut().zip(data) {
                    *dst = src;
                }
                Ok(u16::from_le_bytes(word))
            }
        }
    }

    /// After a `Select` the page is already set, so follow ups use `Current`.
    fn settle(mode: PageMode) -> PageMode {
        match mode {
            PageMode::Select(_) => PageMode::Current,
            other => other,
        }
    }

    fn ready(&mut self, address: u8) -> Result<()> {
        self.smbus.wait_for_ack(address, commands::PAGE)?;
        self.wait_for_not_busy(address)
    }

    pub fn vout_mode(&mut self, address: u8, mode: PageMode) -> Result<u8> {
        self.read_byte_paged(address, mode, commands::VOUT_MODE)
    }

    // Numeric settings and telemetry

    pub fn set(&mut self, address: u8, mode: PageMode, setting: Setting, value: f32) -> Result<()> {
        let raw = match setting.format() {
            Format::Linear11 => math::float_to_l11(value),
            Format::Linear16 => {
                let vout_mode = self.vout_mode(address, mode)?;
                math::float_to_l16(value, vout_mode)
            }
        };
        let mode = match setting.format() {
            Format::Linear16 => Self::settle(mode),
            Format::Linear11 => mode,
        };
        self.write_word_paged(address, mode, setting.command(), raw)
    }

    pub fn get(&mut self, address: u8, mode: PageMode, setting: Setting, polling: bool) -> Result<f32> {
        self.read_number(address, mode, setting.command(), setting.format(), polling)
    }

    pub fn read(&mut self, address: u8, mode: PageMode, reading: Reading, polling: bool) -> Result<f32> {
        self.read_number(address, mode, reading.command(), reading.format(), polling)
    }

    fn read_number(
        &mut self,
        address: u8,
        mode: PageMode,
        command: u8,
        format: Format,
        polling: bool,
    ) -> Result<f32> {
        if polling {
            self.ready(address)?;
        }
        let raw = self.read_word_paged(address, mode, command)?;
        Ok(match format {
            Format::Linear11 => math::l11_to_float(raw),
            Format::Linear16 => {
                let vout_mode = self.vout_mode(address, Self::settle(mode))?;
                math::l16_to_float(raw, vout_mode)
            }
        })
    }

    pub fn set_vout(&mut self, address: u8, volts: f32) -> Result<()> {
        self.set(address, PageMode::Current, Setting::VoutCommand, volts)
    }

    pub fn read_vout(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Vout, polling)
    }

    pub fn read_vin(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Vin, polling)
    }

    pub fn read_iout(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Iout, polling)
    }

    pub fn read_iin(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Iin, polling)
    }

    pub fn read_pout(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Pout, polling)
    }

    pub fn read_pin(&mut self, address: u8, polling: bool) -> Result<f32> {
        self.read(address, PageMode::Current, Reading::Pin, polling)
    }

    /// Moves VOUT together with its margins and limits.
    ///
    /// Raising writes the upper bounds first and lowering writes the lower
    /// bounds first, so the output never sits outside a limit in between.
    pub fn set_vout_with_supervision(
        &mut self,
        address: u8,
        mode: PageMode,
        volts: f32,
        supervision: Supervision,
    ) -> Result<()> {
        let current = self.read(address, mode, Reading::Vout, false)?;
        let mode = Self::settle(mode);
        let Supervision {
            margin,
            warn,
            fault,
        } = supervision;

        let upper = [
            (Setting::VoutOvFaultLimit, volts * (1.0 + fault)),
            (Setting::VoutOvWarnLimit, volts * (1.0 + warn)),
            (Setting::VoutMarginHigh, volts * (1.0 + margin)),
        ];
        let lower = [
            (Setting::VoutMarginLow, volts * (1.0 - margin)),
            (Setting::VoutUvWarnLimit, volts * (1.0 - warn)),
            (Setting::VoutUvFaultLimit, volts * (1.0 - fault)),
        ];

        let vout_mode = self.vout_mode(address, mode)?;
        let write = |pmbus: &mut Self, setting: Setting, value: f32| {
            let raw = math::float_to_l16(value, vout_mode);
            pmbus.write_word_paged(address, mode, setting.command(), raw)
        };

        if volts >= current {
            for (setting, value) in upper {
                write(self, setting, value)?;
            }
            write(self, Setting::VoutCommand, volts)?;
            for (setting, value) in lower {
                write(self, setting, value)?;
            }
        } else {
            for (setting, value) in lower.into_iter().rev() {
                write(self, setting, value)?;
            }
            write(self, Setting::VoutCommand, volts)?;
            for (setting, value) in upper.into_iter().rev() {
                write(self, setting, value)?;
            }
        }
        Ok(())
    }

    // Status

    pub fn read_status_byte(&mut self, address: u8, mode: PageMode) -> Result<u8> {
        self.read_byte_paged(address, mode, commands::STATUS_BYTE)
    }

    pub fn read_status_word(&mut self, address: u8, mode: PageMode) -> Result<StatusWord> {
        Ok(StatusWord(self.read_word_paged(address, mode, commands::STATUS_WORD)?))
    }

    pub fn read_status(&mut self, address: u8, mode: PageMode, register: StatusRegister) -> Result<u8> {
        self.read_byte_paged(address, mode, register.command())
    }

    pub fn read_mfr_fault_log_status(&mut self, address: u8) -> Result<u8> {
        self.smbus.read_byte(address, commands::MFR_FAULT_LOG_STATUS)
    }

    pub fn read_mfr_pads(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::MFR_PADS)
    }

    pub fn read_pmbus_revision(&mut self, address: u8) -> Result<u8> {
        self.smbus.read_byte(address, commands::PMBUS_REVISION)
    }

    pub fn read_mfr_special_id(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::MFR_SPECIAL_ID)
    }

    pub fn read_model(&mut self, address: u8) -> Result<String> {
        let raw = self.smbus.read_block(address, commands::MFR_MODEL, 8)?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
    }

    pub fn set_smbalert_mask(&mut self, address: u8, register: StatusRegister, mask: u8) -> Result<()> {
        let word = ((mask as u16) << 8) | register.command() as u16;
        self.smbus.write_word(address, commands::SMBALERT_MASK, word)
    }

    pub fn get_smbalert_mask(&mut self, address: u8, register: StatusRegister) -> Result<u8> {
        let data = self.smbus.write_read_block(
            address,
            commands::SMBALERT_MASK,
            &[register.command()],
            1,
        )?;
        Ok(data.first().copied().unwrap_or_default())
    }

    // Faults

    pub fn clear_faults(&mut self, address: u8) -> Result<()> {
        self.smbus.send_byte(address, commands::CLEAR_FAULTS)
    }

    /// Clears faults on every page of the device at `address`.
    pub fn clear_all_faults(&mut self, address: u8) -> Result<()> {
        let info = self.device_type(address)?;
        match info {
            Some(info) if info.role == Role::Manager => {
                for page in 0..info.pages {
                    self.set_page(address, page)?;
                    self.smbus.send_byte(address, commands::CLEAR_FAULTS)?;
                }
                Ok(())
            }
            _ => {
                self.set_page(address, ALL_PAGES)?;
                self.smbus.send_byte(address, commands::CLEAR_FAULTS)
            }
        }
    }

    pub fn clear_faults_global(&mut self) -> Result<()> {
        self.set_page(GLOBAL_ADDRESS, ALL_PAGES)?;
        self.smbus.send_byte(GLOBAL_ADDRESS, commands::CLEAR_FAULTS)?;
        self.set_page(GLOBAL_ADDRESS, 0)?;
        self.smbus.send_byte(GLOBAL_ADDRESS, commands::CLEAR_FAULTS)
    }

    // Write protection

    pub fn enable_write_protect(&mut self, address: u8) -> Result<()> {
        self.smbus
            .write_byte(address, commands::WRITE_PROTECT, write_protect::ENABLED)
    }

    pub fn disable_write_protect(&mut self, address: u8) -> Result<()> {
        self.smbus
            .write_byte(address, commands::WRITE_PROTECT, write_protect::DISABLED)
    }

    pub fn enable_write_protect_global(&mut self) -> Result<()> {
        self.enable_write_protect(GLOBAL_ADDRESS)
    }

    pub fn disable_write_protect_global(&mut self) -> Result<()> {
        self.disable_write_protect(GLOBAL_ADDRESS)
    }

    // NVM

    pub fn store(&mut self, address: u8) -> Result<()> {
        self.smbus.send_byte(address, commands::STORE_USER_ALL)
    }

    pub fn restore(&mut self, address: u8) -> Result<()> {
        self.smbus.send_byte(address, commands::RESTORE_USER_ALL)
    }

    pub fn store_all(&mut self, addresses: &[u8]) -> Result<()> {
        addresses.iter().try_for_each(|&a| self.store(a))
    }

    pub fn restore_all(&mut self, addresses: &[u8]) -> Result<()> {
        addresses.iter().try_for_each(|&a| self.restore(a))
    }

    pub fn store_global(&mut self) -> Result<()> {
        self.store(GLOBAL_ADDRESS)
    }

    pub fn restore_global(&mut self) -> Result<()> {
        self.restore(GLOBAL_ADDRESS)
    }

    pub fn lock_nvm(&mut self, address: u8) -> Result<()> {
        self.wait_for_not_busy(address)?;
        self.smbus
            .write_byte(address, commands::MFR_EE_UNLOCK, nvm_key::LOCK)?;
        self.wait_for_not_busy(address)?;
        if self.smbus.read_byte(address, commands::MFR_EE_UNLOCK)? != nvm_key::LOCK {
            return Err(Error::NvmLock { address });
        }
        Ok(())
    }

    pub fn unlock_nvm(&mut self, address: u8) -> Result<()> {
        self.lock_nvm(address)?;
        for key in [nvm_key::FIRST, nvm_key::SECOND] {
            self.wait_for_not_busy(address)?;
            self.smbus.write_byte(address, commands::MFR_EE_UNLOCK, key)?;
        }
        self.wait_for_not_busy(address)?;
        if self.smbus.read_byte(address, commands::MFR_EE_UNLOCK)? != nvm_key::SECOND {
            return Err(Error::NvmLock { address });
        }
        Ok(())
    }

    pub fn erase_nvm(&mut self, address: u8) -> Result<()> {
        self.wait_for_not_busy(address)?;
        self.smbus
            .write_byte(address, commands::MFR_EE_ERASE, nvm_key::ERASE)?;
        self.wait_for_not_busy(address)
    }

    /// True when RAM matches the stored NVM image.
    pub fn compare_ram_with_nvm(&mut self, address: u8) -> Result<bool> {
        self.wait_for_not_busy(address)?;
        self.smbus.send_byte(address, commands::MFR_COMPARE_USER_ALL)?;
        self.wait_for_not_busy(address)?;
        self.wait_for_nvm_done(address)?;
        let status = self.read_status_byte(address, PageMode::Current)?;
        Ok(status & status_byte::CML == 0)
    }

    // Sequencing and margining

    fn operation_all(&mut self, addresses: &[u8], command: u8, value: u8) -> Result<()> {
        let writes: Vec<_> = addresses.iter().map(|&a| (a, command, value)).collect();
        self.smbus.write_bytes(&writes)
    }

    pub fn page_all(&mut self, addresses: &[u8]) -> Result<()> {
        self.operation_all(addresses, commands::PAGE, ALL_PAGES)
    }

    pub fn sequence_on(&mut self, addresses: &[u8]) -> Result<()> {
        self.operation_all(addresses, commands::OPERATION, operation::ON)
    }

    pub fn sequence_off(&mut self, addresses: &[u8]) -> Result<()> {
        self.operation_all(addresses, commands::OPERATION, operation::SEQUENCE_OFF)
    }

    pub fn immediate_off(&mut self, addresses: &[u8]) -> Result<()> {
        self.operation_all(addresses, commands::OPERATION, operation::IMMEDIATE_OFF)
    }

    fn operation_global(&mut self, value: u8) -> Result<()> {
        self.set_page(GLOBAL_ADDRESS, ALL_PAGES)?;
        self.smbus
            .write_byte(GLOBAL_ADDRESS, commands::OPERATION, value)
    }

    pub fn sequence_on_global(&mut self) -> Result<()> {
        self.operation_global(operation::ON)
    }

    pub fn sequence_off_global(&mut self) -> Result<()> {
        self.operation_global(operation::SEQUENCE_OFF)
    }

    pub fn immediate_off_global(&mut self) -> Result<()> {
        self.operation_global(operation::IMMEDIATE_OFF)
    }

    fn margin_pages(&mut self, targets: &[(u8, u8)], value: u8) -> Result<()> {
        let writes: Vec<_> = targets
            .iter()
            .flat_map(|&(address, page)| {
                [
                    (address, commands::PAGE, page),
                    (address, commands::OPERATION, value),
                ]
            })
            .collect();
        self.smbus.write_bytes(&writes)
    }

    /// Margins each (address, page) pair high.
    pub fn margin_high_all(&mut self, targets: &[(u8, u8)]) -> Result<()> {
        self.margin_pages(targets, operation::MARGIN_HIGH)
    }

    pub fn margin_low_all(&mut self, targets: &[(u8, u8)]) -> Result<()> {
        self.margin_pages(targets, operation::MARGIN_LOW)
    }

    pub fn margin_off_all(&mut self, targets: &[(u8, u8)]) -> Result<()> {
        self.margin_pages(targets, operation::ON)
    }

    pub fn margin_high(&mut self, address: u8) -> Result<()> {
        self.smbus
            .write_byte(address, commands::OPERATION, operation::MARGIN_HIGH)
    }

    pub fn margin_low(&mut self, address: u8) -> Result<()> {
        self.smbus
            .write_byte(address, commands::OPERATION, operation::MARGIN_LOW)
    }

    pub fn margin_off(&mut self, address: u8) -> Result<()> {
        self.smbus.write_byte(address, commands::OPERATION, operation::ON)
    }

    pub fn margin_high_global(&mut self) -> Result<()> {
        self.operation_global(operation::MARGIN_HIGH)
    }

    pub fn margin_low_global(&mut self) -> Result<()> {
        self.operation_global(operation::MARGIN_LOW)
    }

    pub fn margin_off_global(&mut self) -> Result<()> {
        self.operation_global(operation::ON)
    }

    pub fn reset(&mut self, address: u8) -> Result<()> {
        self.smbus.send_byte(address, commands::MFR_RESET)
    }

    pub fn reset_global(&mut self) -> Result<()> {
        self.set_page(GLOBAL_ADDRESS, ALL_PAGES)?;
        self.reset(GLOBAL_ADDRESS)
    }

    // Raw registers

    pub fn set_user_data_03(&mut self, address: u8, data: u16) -> Result<()> {
        self.smbus.write_word(address, commands::USER_DATA_03, data)
    }

    pub fn get_user_data_03(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::USER_DATA_03)
    }

    pub fn set_user_data_04(&mut self, address: u8, data: u16) -> Result<()> {
        self.smbus.write_word(address, commands::USER_DATA_04, data)
    }

    pub fn get_user_data_04(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::USER_DATA_04)
    }

    pub fn set_spare_0(&mut self, address: u8, data: u16) -> Result<()> {
        self.smbus.write_word(address, commands::MFR_SPARE_0, data)
    }

    pub fn get_spare_0(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::MFR_SPARE_0)
    }

    pub fn set_temp_1_gain(&mut self, address: u8, gain: u16) -> Result<()> {
        self.smbus.write_word(address, commands::MFR_TEMP_1_GAIN, gain)
    }

    pub fn get_temp_1_gain(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::MFR_TEMP_1_GAIN)
    }

    pub fn set_temp_1_offset(&mut self, address: u8, offset: u16) -> Result<()> {
        self.smbus
            .write_word(address, commands::MFR_TEMP_1_OFFSET, offset)
    }

    pub fn get_temp_1_offset(&mut self, address: u8) -> Result<u16> {
        self.smbus.read_word(address, commands::MFR_TEMP_1_OFFSET)
    }

    pub fn set_rail_address(&mut self, address: u8, rail_address: u8) -> Result<()> {
        self.smbus
            .write_byte(address, commands::MFR_RAIL_ADDRESS, rail_address)
    }

    pub fn get_rail_address(&mut self, address: u8) -> Result<u8> {
        self.smbus.read_byte(address, commands::MFR_RAIL_ADDRESS)
    }

    pub fn set_page(&mut self, address: u8, page: u8) -> Result<()> {
        self.smbus.write_byte(address, commands::PAGE, page)
    }

    /// Sets the page once the device acknowledges and is idle.
    pub fn set_page_polled(&mut self, address: u8, page: u8) -> Result<()> {
        self.ready(address)?;
        self.set_page(address, page)
    }

    pub fn get_page(&mut self, address: u8) -> Result<u8> {
        self.smbus.read_byte(address, commands::PAGE)
    }

    // PEC requirement

    fn update_config_all(&mut self, address: u8, set: bool, bit: u16) -> Result<()> {
        let id = self.read_mfr_special_id(address)?;
        let info = self
            .registry
            .find(id)
            .ok_or(Error::UnknownDevice { address, id })?;
        let apply = |value: u16| if set { value | bit } else { value & !bit };
        match info.config_width {
            ConfigWidth::Byte => {
                let config = self.smbus.read_byte(address, commands::MFR_CONFIG_ALL)?;
                self.smbus
                    .write_byte(address, commands::MFR_CONFIG_ALL, apply(config as u16) as u8)
            }
            ConfigWidth::Word => {
                let config = self.smbus.read_word(address, commands::MFR_CONFIG_ALL)?;
                self.smbus
                    .write_word(address, commands::MFR_CONFIG_ALL, apply(config))
            }
        }
    }

    /// Makes the device require PEC on every transaction.
    pub fn enable_pec(&mut self, address: u8) -> Result<()> {
        self.update_config_all(address, true, config_all::PEC_REQUIRED)
    }

    pub fn disable_pec(&mut self, address: u8) -> Result<()> {
        self.update_config_all(address, false, config_all::PEC_REQUIRED)
    }

    /// Enables clock stretching for fast bus speeds.
    pub fn set_clock_stretch(&mut self, address: u8, enabled: bool) -> Result<()> {
        let config = self.smbus.read_byte(address, commands::MFR_CONFIG_ALL)?;
        let bit = config_all::CLOCK_STRETCH as u8;
        let config = if enabled { config | bit } else { config & !bit };
        self.smbus
            .write_byte(address, commands::MFR_CONFIG_ALL, config)
    }

    // Polling

    pub fn wait_for_ack(&mut self, address: u8, command: u8) -> Result<()> {
        self.smbus.wait_for_ack(address, command)
    }

    pub fn wait_for_not_busy(&mut self, address: u8) -> Result<()> {
        let config = self.smbus.poll_config();
        let mut poll = Poll::new(config.not_busy_attempts, config.deadline);
        let idle = mfr_common::NOT_BUSY | mfr_common::NOT_PENDING;
        while poll.attempt() {
            match self.smbus.read_byte(address, commands::MFR_COMMON) {
                Ok(0xff) => continue,
                Ok(common) if common & idle == idle => return Ok(()),
                Ok(_) | Err(Error::Nack { .. }) | Err(Error::Pec { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Timeout {
            address,
            what: "not busy",
        })
    }

    /// Polls `MFR_EEPROM_STATUS` until the NVM is idle. A device that stays
    /// silent through one acknowledge wait is polled again rather than given
    /// up on, only the outer budget ends the wait.
    pub fn wait_for_nvm_done(&mut self, address: u8) -> Result<()> {
        let config = self.smbus.poll_config();
        let mut poll = Poll::new(config.nvm_attempts, config.deadline);
        while poll.attempt() {
            match self.smbus.wait_for_ack(address, commands::PAGE) {
                Ok(()) => (),
                Err(Error::Timeout { .. }) => {
                    log::debug!("0x{:02x} still silent while NVM busy", address);
                    continue;
                }
                Err(e) => return Err(e),
            }
            match self.smbus.read_byte(address, commands::MFR_EEPROM_STATUS) {
                Ok(0xff) => continue,
                Ok(status) if status & EEPROM_STATUS_BUSY_MASK == 0 => return Ok(()),
                Ok(_) | Err(Error::Nack { .. }) | Err(Error::Pec { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Timeout {
            address,
            what: "NVM done",
        })
    }

    pub fn delay(&mut self, duration: Duration) {
        self.smbus.delay(duration)
    }

    // Group command protocol

    pub fn start_group_protocol(&mut self) -> Result<()> {
        self.smbus.begin_queue()
    }

    pub fn execute_group_protocol(&mut self) -> Result<()> {
        self.smbus.execute()
    }

    pub fn abort_group_protocol(&mut self) {
        self.smbus.abort_queue()
    }

    /// Sends everything `f` writes as one group command. When `f` fails the
    /// queue is dropped and nothing reaches the bus.
    pub fn group<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.start_group_protocol()?;
        match f(self) {
            Ok(out) => {
                self.execute_group_protocol()?;
                Ok(out)
            }
            Err(e) => {
                self.abort_group_protocol();
                Err(e)
            }
        }
    }

    // Identity

    /// Registry entry for the part at `address`, by its masked special id.
    pub fn device_type(&mut self, address: u8) -> Result<Option<DeviceInfo>> {
        let id = self.read_mfr_special_id(address)?;
        Ok(self.registry.find(id))
    }

    /// Addresses from `addresses` that are missing from the bus or report a
    /// memory fault, in the order given.
    ///
    /// A healthy device answering at the same address hides a bricked one.
    pub fn bricks(&mut self, addresses: &[u8]) -> Result<Vec<u8>> {
        let on_bus = self.smbus.probe(commands::PAGE)?;
        let mut bricked = Vec::new();
        for &address in addresses {
            let healthy = on_bus.contains(&address)
                && match self.smbus.read_byte(address, commands::STATUS_CML) {
                    Ok(cml) => cml & status_cml::MEMORY_FAULT == 0,
                    Err(Error::Nack { .. }) | Err(Error::Pec { .. }) => false,
                    Err(e) => return Err(e),
                };
            if !healthy {
                bricked.push(address);
            }
        }
        Ok(bricked)
    }
}
