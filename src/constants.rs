//! PMBus register map and bus-level constants.

/// Broadcast address answered by every device on the bus.
pub const GLOBAL_ADDRESS: u8 = 0x5b;
/// SMBus alert response address.
pub const ALERT_RESPONSE_ADDRESS: u8 = 0x0c;

/// Page value selecting all pages at once.
pub const ALL_PAGES: u8 = 0xff;
/// `MFR_RAIL_ADDRESS` value meaning rail addressing is disabled.
pub const RAIL_ADDRESS_DISABLED: u8 = 0x80;

/// First and last (exclusive) address scanned by a probe.
pub const PROBE_FIRST: u8 = 0x10;
pub const PROBE_LAST: u8 = 0x7f;

pub const DEFAULT_ACK_ATTEMPTS: u32 = 8192;
pub const DEFAULT_NOT_BUSY_ATTEMPTS: u32 = 4096;
pub const DEFAULT_NVM_ATTEMPTS: u32 = 8192;

pub const SPEED_400K: u32 = 400_000;
pub const SPEED_100K: u32 = 100_000;
pub const SPEED_10K: u32 = 10_000;

pub mod commands {
    pub const PAGE: u8 = 0x00;
    pub const OPERATION: u8 = 0x01;
    pub const ON_OFF_CONFIG: u8 = 0x02;
    pub const CLEAR_FAULTS: u8 = 0x03;
    pub const PAGE_PLUS_WRITE: u8 = 0x05;
    pub const PAGE_PLUS_READ: u8 = 0x06;
    pub const WRITE_PROTECT: u8 = 0x10;
    pub const STORE_USER_ALL: u8 = 0x15;
    pub const RESTORE_USER_ALL: u8 = 0x16;
    pub const SMBALERT_MASK: u8 = 0x1b;
    pub const VOUT_MODE: u8 = 0x20;
    pub const VOUT_COMMAND: u8 = 0x21;
    pub const VOUT_MAX: u8 = 0x24;
    pub const VOUT_MARGIN_HIGH: u8 = 0x25;
    pub const VOUT_MARGIN_LOW: u8 = 0x26;
    pub const VOUT_OV_FAULT_LIMIT: u8 = 0x40;
    pub const VOUT_OV_FAULT_RESPONSE: u8 = 0x41;
    pub const VOUT_OV_WARN_LIMIT: u8 = 0x42;
    pub const VOUT_UV_WARN_LIMIT: u8 = 0x43;
    pub const VOUT_UV_FAULT_LIMIT: u8 = 0x44;
    pub const VOUT_UV_FAULT_RESPONSE: u8 = 0x45;
    pub const IOUT_OC_FAULT_LIMIT: u8 = 0x46;
    pub const IOUT_OC_WARN_LIMIT: u8 = 0x4a;
    pub const OT_FAULT_LIMIT: u8 = 0x4f;
    pub const OT_WARN_LIMIT: u8 = 0x51;
    pub const UT_WARN_LIMIT: u8 = 0x52;
    pub const UT_FAULT_LIMIT: u8 = 0x53;
    pub const VIN_OV_FAULT_LIMIT: u8 = 0x55;
    pub const VIN_OV_WARN_LIMIT: u8 = 0x57;
    pub const VIN_UV_WARN_LIMIT: u8 = 0x58;
    pub const VIN_UV_FAULT_LIMIT: u8 = 0x59;
    pub const IIN_OC_WARN_LIMIT: u8 = 0x5d;
    pub const TON_DELAY: u8 = 0x60;
    pub const TON_RISE: u8 = 0x61;
    pub const TON_MAX_FAULT_LIMIT: u8 = 0x62;
    pub const TON_MAX_FAULT_RESPONSE: u8 = 0x63;
    pub const TOFF_DELAY: u8 = 0x64;
    pub const TOFF_FALL: u8 = 0x65;
    pub const TOFF_MAX_WARN_LIMIT: u8 = 0x66;
    pub const STATUS_BYTE: u8 = 0x78;
    pub const STATUS_WORD: u8 = 0x79;
    pub const STATUS_VOUT: u8 = 0x7a;
    pub const STATUS_IOUT: u8 = 0x7b;
    pub const STATUS_INPUT: u8 = 0x7c;
    pub const STATUS_TEMP: u8 = 0x7d;
    pub const STATUS_CML: u8 = 0x7e;
    pub const STATUS_MFR_SPECIFIC: u8 = 0x80;
    pub const READ_VIN: u8 = 0x88;
    pub const READ_IIN: u8 = 0x89;
    pub const READ_VOUT: u8 = 0x8b;
    pub const READ_IOUT: u8 = 0x8c;
    /// Internal temperature on the LTC297x managers.
    pub const READ_OTEMP: u8 = 0x8d;
    pub const READ_ITEMP: u8 = 0x8e;
    pub const READ_DUTY_CYCLE: u8 = 0x94;
    pub const READ_POUT: u8 = 0x96;
    pub const READ_PIN: u8 = 0x97;
    pub const PMBUS_REVISION: u8 = 0x98;
    pub const MFR_MODEL: u8 = 0x9a;
    pub const USER_DATA_03: u8 = 0xb3;
    pub const USER_DATA_04: u8 = 0xb4;
    pub const MFR_EE_UNLOCK: u8 = 0xbd;
    pub const MFR_EE_ERASE: u8 = 0xbe;
    pub const MFR_EE_DATA: u8 = 0xbf;
    pub const MFR_CONFIG_LTC2974: u8 = 0xd0;
    pub const MFR_CONFIG_ALL: u8 = 0xd1;
    pub const MFR_WATCHDOG_T_FIRST: u8 = 0xe2;
    pub const MFR_WATCHDOG_T: u8 = 0xe3;
    pub const MFR_PADS: u8 = 0xe5;
    pub const MFR_ADDRESS: u8 = 0xe6;
    pub const MFR_SPECIAL_ID: u8 = 0xe7;
    pub const MFR_FAULT_LOG_STORE: u8 = 0xea;
    pub const MFR_FAULT_LOG_RESTORE: u8 = 0xeb;
    pub const MFR_FAULT_LOG_CLEAR: u8 = 0xec;
    pub const MFR_FAULT_LOG_STATUS: u8 = 0xed;
    pub const MFR_FAULT_LOG: u8 = 0xee;
    pub const MFR_COMMON: u8 = 0xef;
    pub const MFR_COMPARE_USER_ALL: u8 = 0xf0;
    pub const MFR_EEPROM_STATUS: u8 = 0xf1;
    pub const MFR_SPARE_0: u8 = 0xf7;
    pub const MFR_TEMP_1_GAIN: u8 = 0xf8;
    pub const MFR_TEMP_1_OFFSET: u8 = 0xf9;
    pub const MFR_RAIL_ADDRESS: u8 = 0xfa;
    pub const MFR_RESET: u8 = 0xfd;
}

/// `OPERATION` register values.
pub mod operation {
    pub const IMMEDIATE_OFF: u8 = 0x00;
    pub const SEQUENCE_OFF: u8 = 0x40;
    pub const ON: u8 = 0x80;
    pub const MARGIN_LOW: u8 = 0x98;
    pub const MARGIN_HIGH: u8 = 0xa8;
}

pub mod write_protect {
    pub const ENABLED: u8 = 0x80;
    pub const DISABLED: u8 = 0x00;
}

/// Bits of `MFR_COMMON`.
pub mod mfr_common {
    pub const NOT_BUSY: u8 = 0x40;
    pub const NOT_PENDING: u8 = 0x20;
}

/// `MFR_EE_UNLOCK` key sequence.
pub mod nvm_key {
    pub const LOCK: u8 = 0x00;
    pub const FIRST: u8 = 0x2b;
    pub const SECOND: u8 = 0xd4;
    pub const ERASE: u8 = 0x2b;
}

pub mod status_byte {
    pub const CML: u8 = 0x02;
}

pub mod status_cml {
    pub const MEMORY_FAULT: u8 = 0x10;
}

pub mod status_vout {
    pub const UV_FAULT: u8 = 0x10;
}

/// `MFR_CONFIG_ALL` bits shared across families.
pub mod config_all {
    pub const CLOCK_STRETCH: u16 = 0x0002;
    pub const PEC_REQUIRED: u16 = 0x0004;
}

/// Busy bit in `MFR_EEPROM_STATUS`.
pub const EEPROM_STATUS_BUSY_MASK: u8 = 0xc0;
