//! Error types shared by every layer of the stack.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no acknowledge from 0x{address:02x}")]
    Nack { address: u8 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(
        "PEC mismatch from 0x{address:02x} cmd 0x{command:02x}: expected 0x{expected:02x}, got 0x{actual:02x}"
    )]
    Pec {
        address: u8,
        command: u8,
        expected: u8,
        actual: u8,
    },

    #[error("block from 0x{address:02x} cmd 0x{command:02x} reports {reported} bytes, room for {capacity}")]
    BlockLength {
        address: u8,
        command: u8,
        reported: usize,
        capacity: usize,
    },

    #[error("{length} byte transfer with 0x{address:02x} does not fit a length byte")]
    BlockTooLong { address: u8, length: usize },

    #[error("timed out waiting for {what} on 0x{address:02x}")]
    Timeout { address: u8, what: &'static str },

    #[error("group queue already holds pending commands")]
    QueuePending,

    #[error("invalid hex digit {0:#04x}")]
    InvalidHex(u8),

    #[error("hex line carries {0} bytes, more than a line buffer holds")]
    LineTooLong(usize),

    #[error("image ended before the end-of-records marker")]
    Truncated,

    #[error("record type 0x{kind:02x} declares {length} bytes, larger than the record buffer")]
    RecordTooLarge { length: usize, kind: u16 },

    #[error("record type 0x{kind:02x} with length {length} is too short for its payload")]
    Malformed { kind: u16, length: usize },

    #[error("unknown record type 0x{0:02x}")]
    UnknownRecord(u16),

    #[error("record type 0x{0:02x} is not supported")]
    UnsupportedRecord(u16),

    #[error("unknown event id 0x{0:02x}")]
    UnknownEvent(u16),

    #[error("unknown meta data type 0x{0:02x}")]
    UnknownMetaData(u16),

    #[error(
        "read from 0x{address:02x} cmd 0x{command:02x} returned 0x{actual:04x}, expected 0x{expected:04x}"
    )]
    ExpectMismatch {
        address: u8,
        command: u8,
        expected: u16,
        actual: u16,
    },

    #[error(
        "NVM word {index} at 0x{address:02x} cmd 0x{command:02x} reads 0x{actual:04x}, expected 0x{expected:04x}"
    )]
    VerifyMismatch {
        address: u8,
        command: u8,
        index: usize,
        expected: u16,
        actual: u16,
    },

    #[error("NVM lock state of 0x{address:02x} did not change")]
    NvmLock { address: u8 },

    #[error("device 0x{address:02x} reports unknown id 0x{id:04x}")]
    UnknownDevice { address: u8, id: u16 },

    #[error("device registry: {0}")]
    Registry(#[from] serde_yaml::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] scroll::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
