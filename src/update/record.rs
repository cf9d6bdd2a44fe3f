//! Binary records carried by the program image.
//!
//! Every record starts with a little-endian `length: u16, kind: u16` header
//! where `length` includes the header. Payloads are byte-packed, all
//! multi-byte fields little-endian.
use std::fmt;

use scroll::{IOwrite, Pread, LE};

use super::hex::HexDecoder;
use crate::{Error, Result};

/// Largest record the reader buffers.
pub const MAX_RECORD_SIZE: usize = 600;
pub const HEADER_SIZE: usize = 4;

pub mod kind {
    pub const WRITE_BYTE: u16 = 0x01;
    pub const WRITE_WORD: u16 = 0x02;
    pub const WRITE_BLOCK: u16 = 0x03;
    pub const READ_BYTE_EXPECT: u16 = 0x04;
    pub const READ_WORD_EXPECT: u16 = 0x05;
    pub const READ_BLOCK_EXPECT: u16 = 0x06;
    pub const DEVICE_ADDRESS: u16 = 0x07;
    pub const PACKING_CODE: u16 = 0x08;
    pub const NVM_DATA: u16 = 0x09;
    pub const READ_BYTE_LOOP_MASK: u16 = 0x0a;
    pub const READ_WORD_LOOP_MASK: u16 = 0x0b;
    pub const POLL_UNTIL_ACK_NOPEC: u16 = 0x0c;
    pub const DELAY_MS: u16 = 0x0d;
    pub const SEND_BYTE: u16 = 0x0e;
    pub const WRITE_BYTE_NOPEC: u16 = 0x0f;
    pub const WRITE_WORD_NOPEC: u16 = 0x10;
    pub const WRITE_BLOCK_NOPEC: u16 = 0x11;
    pub const READ_BYTE_EXPECT_NOPEC: u16 = 0x12;
    pub const READ_WORD_EXPECT_NOPEC: u16 = 0x13;
    pub const READ_BLOCK_EXPECT_NOPEC: u16 = 0x14;
    pub const READ_BYTE_LOOP_MASK_NOPEC: u16 = 0x15;
    pub const READ_WORD_LOOP_MASK_NOPEC: u16 = 0x16;
    pub const SEND_BYTE_NOPEC: u16 = 0x17;
    pub const EVENT: u16 = 0x18;
    pub const READ_BYTE_EXPECT_MASK_NOPEC: u16 = 0x19;
    pub const READ_WORD_EXPECT_MASK_NOPEC: u16 = 0x1a;
    pub const VARIABLE_META_DATA: u16 = 0x1b;
    pub const MODIFY_WORD_NOPEC: u16 = 0x1c;
    pub const MODIFY_BYTE_NOPEC: u16 = 0x1d;
    pub const WRITE_EE_DATA: u16 = 0x1e;
    pub const READ_AND_VERIFY_EE_DATA: u16 = 0x1f;
    pub const MODIFY_BYTE: u16 = 0x20;
    pub const MODIFY_WORD: u16 = 0x21;
    pub const END_OF_RECORDS: u16 = 0x22;
}

/// Meta data types.
pub mod meta {
    pub const SET_GLOBAL_BASE_ADDRESS: u16 = 0x00;
    pub const OEM_SERIAL_NUMBER: u16 = 0x01;
}

/// Device and command a record talks to.
///
/// `pec` is `None` for the record kinds whose header has no PEC flag at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub address: u8,
    pub command: u8,
    pub pec: Option<bool>,
}

impl Target {
    pub fn uses_pec(&self) -> bool {
        self.pec.unwrap_or(false)
    }

    fn with_flag(body: &[u8]) -> Result<Self> {
        Ok(Target {
            address: body.pread_with::<u16>(0, LE)? as u8,
            command: body.pread(2)?,
            pec: Some(body.pread::<u8>(3)? != 0),
        })
    }

    fn plain(body: &[u8]) -> Result<Self> {
        Ok(Target {
            address: body.pread_with::<u16>(0, LE)? as u8,
            command: body.pread(2)?,
            pec: None,
        })
    }

    fn size(&self) -> usize {
        if self.pec.is_some() {
            4
        } else {
            3
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.iowrite_with(self.address as u16, LE)?;
        out.iowrite_with(self.command, LE)?;
        if let Some(pec) = self.pec {
            out.iowrite_with(pec as u8, LE)?;
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}/0x{:02x}", self.address, self.command)?;
        if self.uses_pec() {
            write!(f, " pec")?;
        }
        Ok(())
    }
}

/// Sequencing markers embedded in the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BeforeBegin,
    SystemBeforeProgram,
    SystemBeforeVerify,
    AfterDone,
    SystemAfterVerify,
    BeforeInSystemProgrammingBegin,
    InSystemChipBeforeProgram,
    InSystemChipBeforeVerify,
    InSystemChipAfterVerify,
}

impl TryFrom<u16> for Event {
    type Error = Error;

    fn try_from(id: u16) -> Result<Self> {
        Ok(match id {
            0x00 => Event::BeforeBegin,
            0x01 => Event::SystemBeforeProgram,
            0x02 => Event::SystemBeforeVerify,
            0x03 => Event::AfterDone,
            0x04 => Event::SystemAfterVerify,
            0x10 => Event::BeforeInSystemProgrammingBegin,
            0x11 => Event::InSystemChipBeforeProgram,
            0x12 => Event::InSystemChipBeforeVerify,
            0x13 => Event::InSystemChipAfterVerify,
            other => return Err(Error::UnknownEvent(other)),
        })
    }
}

impl From<Event> for u16 {
    fn from(event: Event) -> u16 {
        match event {
            Event::BeforeBegin => 0x00,
            Event::SystemBeforeProgram => 0x01,
            Event::SystemBeforeVerify => 0x02,
            Event::AfterDone => 0x03,
            Event::SystemAfterVerify => 0x04,
            Event::BeforeInSystemProgrammingBegin => 0x10,
            Event::InSystemChipBeforeProgram => 0x11,
            Event::InSystemChipBeforeVerify => 0x12,
            Event::InSystemChipAfterVerify => 0x13,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    WriteByte { target: Target, data: u8 },
    WriteWord { target: Target, data: u16 },
    SendByte { target: Target },
    ReadByteExpect { target: Target, expected: u8 },
    ReadWordExpect { target: Target, expected: u16 },
    ReadByteExpectMask { target: Target, expected: u8, mask: u8 },
    ReadWordExpectMask { target: Target, expected: u16, mask: u16 },
    ReadByteLoopMask { target: Target, mask: u8, expected: u8 },
    ReadWordLoopMask { target: Target, mask: u16, expected: u16 },
    ModifyByte { target: Target, mask: u8, desired: u8 },
    ModifyWord { target: Target, mask: u16, desired: u16 },
    PollUntilAck { target: Target, timeout_ms: u16 },
    DelayMs(u16),
    NvmData { target: Target, words: Vec<u16> },
    WriteEeData { target: Target },
    ReadAndVerifyEeData { target: Target },
    Event(Event),
    MetaData { kind: u16, value: Option<u16> },
    /// Block transfers, recognised but not executed.
    Unsupported { kind: u16, payload: Vec<u8> },
    /// Legacy records carrying nothing to execute.
    Obsolete { kind: u16, payload: Vec<u8> },
    EndOfRecords,
}

impl Record {
    /// Decodes a record from its kind and the bytes following the header.
    pub fn parse(kind: u16, body: &[u8]) -> Result<Self> {
        use self::kind::*;

        let need = |size: usize| -> Result<()> {
            if body.len() < size {
                Err(Error::Malformed {
                    kind,
                    length: body.len() + HEADER_SIZE,
                })
            } else {
                Ok(())
            }
        };

        let record = match kind {
            WRITE_BYTE | WRITE_BYTE_NOPEC => {
                let target = Self::target(kind == WRITE_BYTE, body, &need)?;
                need(target.size() + 1)?;
                Record::WriteByte {
                    target,
                    data: body.pread(target.size())?,
                }
            }
            WRITE_WORD | WRITE_WORD_NOPEC => {
                let target = Self::target(kind == WRITE_WORD, body, &need)?;
                need(target.size() + 2)?;
                Record::WriteWord {
                    target,
                    data: body.pread_with(target.size(), LE)?,
                }
            }
            SEND_BYTE | SEND_BYTE_NOPEC => Record::SendByte {
                target: Self::target(kind == SEND_BYTE, body, &need)?,
            },
            READ_BYTE_EXPECT | READ_BYTE_EXPECT_NOPEC => {
                let target = Self::target(kind == READ_BYTE_EXPECT, body, &need)?;
                need(target.size() + 1)?;
                Record::ReadByteExpect {
                    target,
                    expected: body.pread(target.size())?,
                }
            }
            READ_WORD_EXPECT | READ_WORD_EXPECT_NOPEC => {
                let target = Self::target(kind == READ_WORD_EXPECT, body, &need)?;
                need(target.size() + 2)?;
                Record::ReadWordExpect {
                    target,
                    expected: body.pread_with(target.size(), LE)?,
                }
            }
            READ_BYTE_EXPECT_MASK_NOPEC => {
                need(5)?;
                Record::ReadByteExpectMask {
                    target: Target::plain(body)?,
                    expected: body.pread(3)?,
                    mask: body.pread(4)?,
                }
            }
            READ_WORD_EXPECT_MASK_NOPEC => {
                need(7)?;
                Record::ReadWordExpectMask {
                    target: Target::plain(body)?,
                    expected: body.pread_with(3, LE)?,
                    mask: body.pread_with(5, LE)?,
                }
            }
            READ_BYTE_LOOP_MASK | READ_BYTE_LOOP_MASK_NOPEC => {
                let target = Self::target(kind == READ_BYTE_LOOP_MASK, body, &need)?;
                let at = target.size();
                need(at + 2)?;
                Record::ReadByteLoopMask {
                    target,
                    mask: body.pread(at)?,
                    expected: body.pread(at + 1)?,
                }
            }
            READ_WORD_LOOP_MASK | READ_WORD_LOOP_MASK_NOPEC => {
                let target = Self::target(kind == READ_WORD_LOOP_MASK, body, &need)?;
                let at = target.size();
                need(at + 4)?;
                Record::ReadWordLoopMask {
                    target,
                    mask: body.pread_with(at, LE)?,
                    expected: body.pread_with(at + 2, LE)?,
                }
            }
            MODIFY_BYTE | MODIFY_BYTE_NOPEC => {
                need(6)?;
                let mut target = Target::with_flag(body)?;
                if kind == MODIFY_BYTE_NOPEC {
                    target.pec = None;
                }
                Record::ModifyByte {
                    target,
                    mask: body.pread(4)?,
                    desired: body.pread(5)?,
                }
            }
            MODIFY_WORD | MODIFY_WORD_NOPEC => {
                need(8)?;
                let mut target = Target::with_flag(body)?;
                if kind == MODIFY_WORD_NOPEC {
                    target.pec = None;
                }
                Record::ModifyWord {
                    target,
                    mask: body.pread_with(4, LE)?,
                    desired: body.pread_with(6, LE)?,
                }
            }
            POLL_UNTIL_ACK_NOPEC => {
                need(5)?;
                Record::PollUntilAck {
                    target: Target::plain(body)?,
                    timeout_ms: body.pread_with(3, LE)?,
                }
            }
            DELAY_MS => {
                need(2)?;
                Record::DelayMs(body.pread_with(0, LE)?)
            }
            NVM_DATA => {
                need(4)?;
                let words = body[4..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Record::NvmData {
                    target: Target::with_flag(body)?,
                    words,
                }
            }
            WRITE_EE_DATA => {
                need(4)?;
                Record::WriteEeData {
                    target: Target::with_flag(body)?,
                }
            }
            READ_AND_VERIFY_EE_DATA => {
                need(4)?;
                Record::ReadAndVerifyEeData {
                    target: Target::with_flag(body)?,
                }
            }
            EVENT => {
                need(2)?;
                Record::Event(Event::try_from(body.pread_with::<u16>(0, LE)?)?)
            }
            VARIABLE_META_DATA => {
                need(2)?;
                Record::MetaData {
                    kind: body.pread_with(0, LE)?,
                    value: if body.len() >= 4 {
                        Some(body.pread_with(2, LE)?)
                    } else {
                        None
                    },
                }
            }
            WRITE_BLOCK | READ_BLOCK_EXPECT | WRITE_BLOCK_NOPEC | READ_BLOCK_EXPECT_NOPEC => {
                Record::Unsupported {
                    kind,
                    payload: body.to_vec(),
                }
            }
            DEVICE_ADDRESS | PACKING_CODE => Record::Obsolete {
                kind,
                payload: body.to_vec(),
            },
            END_OF_RECORDS => Record::EndOfRecords,
            other => return Err(Error::UnknownRecord(other)),
        };
        Ok(record)
    }

    fn target(flagged: bool, body: &[u8], need: &impl Fn(usize) -> Result<()>) -> Result<Target> {
        if flagged {
            need(4)?;
            Target::with_flag(body)
        } else {
            need(3)?;
            Target::plain(body)
        }
    }

    /// Wire type of this record.
    pub fn kind(&self) -> u16 {
        use self::kind::*;

        let flagged = |target: &Target| target.pec.is_some();
        match self {
            Record::WriteByte { target, .. } if flagged(target) => WRITE_BYTE,
            Record::WriteByte { .. } => WRITE_BYTE_NOPEC,
            Record::WriteWord { target, .. } if flagged(target) => WRITE_WORD,
            Record::WriteWord { .. } => WRITE_WORD_NOPEC,
            Record::SendByte { target } if flagged(target) => SEND_BYTE,
            Record::SendByte { .. } => SEND_BYTE_NOPEC,
            Record::ReadByteExpect { target, .. } if flagged(target) => READ_BYTE_EXPECT,
            Record::ReadByteExpect { .. } => READ_BYTE_EXPECT_NOPEC,
            Record::ReadWordExpect { target, .. } if flagged(target) => READ_WORD_EXPECT,
            Record::ReadWordExpect { .. } => READ_WORD_EXPECT_NOPEC,
            Record::ReadByteExpectMask { .. } => READ_BYTE_EXPECT_MASK_NOPEC,
            Record::ReadWordExpectMask { .. } => READ_WORD_EXPECT_MASK_NOPEC,
            Record::ReadByteLoopMask { target, .. } if flagged(target) => READ_BYTE_LOOP_MASK,
            Record::ReadByteLoopMask { .. } => READ_BYTE_LOOP_MASK_NOPEC,
            Record::ReadWordLoopMask { target, .. } if flagged(target) => READ_WORD_LOOP_MASK,
            Record::ReadWordLoopMask { .. } => READ_WORD_LOOP_MASK_NOPEC,
            Record::ModifyByte { target, .. } if flagged(target) => MODIFY_BYTE,
            Record::ModifyByte { .. } => MODIFY_BYTE_NOPEC,
            Record::ModifyWord { target, .. } if flagged(target) => MODIFY_WORD,
            Record::ModifyWord { .. } => MODIFY_WORD_NOPEC,
            Record::PollUntilAck { .. } => POLL_UNTIL_ACK_NOPEC,
            Record::DelayMs(_) => DELAY_MS,
            Record::NvmData { .. } => NVM_DATA,
            Record::WriteEeData { .. } => WRITE_EE_DATA,
            Record::ReadAndVerifyEeData { .. } => READ_AND_VERIFY_EE_DATA,
            Record::Event(_) => EVENT,
            Record::MetaData { .. } => VARIABLE_META_DATA,
            Record::Unsupported { kind, .. } | Record::Obsolete { kind, .. } => *kind,
            Record::EndOfRecords => END_OF_RECORDS,
        }
    }

    /// Serializes the record, header included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; HEADER_SIZE];
        match self {
            Record::WriteByte { target, data } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*data, LE)?;
            }
            Record::WriteWord { target, data } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*data, LE)?;
            }
            Record::SendByte { target }
            | Record::WriteEeData { target }
            | Record::ReadAndVerifyEeData { target } => target.write_to(&mut out)?,
            Record::ReadByteExpect { target, expected } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*expected, LE)?;
            }
            Record::ReadWordExpect { target, expected } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*expected, LE)?;
            }
            Record::ReadByteExpectMask {
                target,
                expected,
                mask,
            } => {
                Target { pec: None, ..*target }.write_to(&mut out)?;
                out.iowrite_with(*expected, LE)?;
                out.iowrite_with(*mask, LE)?;
            }
            Record::ReadWordExpectMask {
                target,
                expected,
                mask,
            } => {
                Target { pec: None, ..*target }.write_to(&mut out)?;
                out.iowrite_with(*expected, LE)?;
                out.iowrite_with(*mask, LE)?;
            }
            Record::ReadByteLoopMask {
                target,
                mask,
                expected,
            } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*mask, LE)?;
                out.iowrite_with(*expected, LE)?;
            }
            Record::ReadWordLoopMask {
                target,
                mask,
                expected,
            } => {
                target.write_to(&mut out)?;
                out.iowrite_with(*mask, LE)?;
                out.iowrite_with(*expected, LE)?;
            }
            // The no-PEC modify kinds keep the flag byte in their header.
            Record::ModifyByte {
                target,
                mask,
                desired,
            } => {
                Target {
                    pec: Some(target.uses_pec()),
                    ..*target
                }
                .write_to(&mut out)?;
                out.iowrite_with(*mask, LE)?;
                out.iowrite_with(*desired, LE)?;
            }
            Record::ModifyWord {
                target,
                mask,
                desired,
            } => {
                Target {
                    pec: Some(target.uses_pec()),
                    ..*target
                }
                .write_to(&mut out)?;
                out.iowrite_with(*mask, LE)?;
                out.iowrite_with(*desired, LE)?;
            }
            Record::PollUntilAck { target, timeout_ms } => {
                Target { pec: None, ..*target }.write_to(&mut out)?;
                out.iowrite_with(*timeout_ms, LE)?;
            }
            Record::DelayMs(ms) => out.iowrite_with(*ms, LE)?,
            Record::NvmData { target, words } => {
                Target {
                    pec: Some(target.uses_pec()),
                    ..*target
                }
                .write_to(&mut out)?;
                for word in words {
                    out.iowrite_with(*word, LE)?;
                }
            }
            Record::Event(event) => out.iowrite_with(u16::from(*event), LE)?,
            Record::MetaData { kind, value } => {
                out.iowrite_with(*kind, LE)?;
                if let Some(value) = value {
                    out.iowrite_with(*value, LE)?;
                }
            }
            Record::Unsupported { payload, .. } | Record::Obsolete { payload, .. } => {
                out.extend_from_slice(payload)
            }
            Record::EndOfRecords => {}
        }
        if out.len() > MAX_RECORD_SIZE {
            return Err(Error::RecordTooLarge {
                length: out.len(),
                kind: self.kind(),
            });
        }
        let length = out.len() as u16;
        out[..2].copy_from_slice(&length.to_le_bytes());
        out[2..4].copy_from_slice(&self.kind().to_le_bytes());
        Ok(out)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::WriteByte { target, data } => write!(f, "write byte {} <- 0x{:02x}", target, data),
            Record::WriteWord { target, data } => write!(f, "write word {} <- 0x{:04x}", target, data),
            Record::SendByte { target } => write!(f, "send byte {}", target),
            Record::ReadByteExpect { target, expected } => {
                write!(f, "expect byte {} == 0x{:02x}", target, expected)
            }
            Record::ReadWordExpect { target, expected } => {
                write!(f, "expect word {} == 0x{:04x}", target, expected)
            }
            Record::ReadByteExpectMask {
                target,
                expected,
                mask,
            } => write!(f, "expect byte {} & 0x{:02x} == 0x{:02x}", target, mask, expected),
            Record::ReadWordExpectMask {
                target,
                expected,
                mask,
            } => write!(f, "expect word {} & 0x{:04x} == 0x{:04x}", target, mask, expected),
            Record::ReadByteLoopMask {
                target,
                mask,
                expected,
            } => write!(f, "loop byte {} & 0x{:02x} == 0x{:02x}", target, mask, expected),
            Record::ReadWordLoopMask {
                target,
                mask,
                expected,
            } => write!(f, "loop word {} & 0x{:04x} == 0x{:04x}", target, mask, expected),
            Record::ModifyByte {
                target,
                mask,
                desired,
            } => write!(f, "modify byte {} & 0x{:02x} := 0x{:02x}", target, mask, desired),
            Record::ModifyWord {
                target,
                mask,
                desired,
            } => write!(f, "modify word {} & 0x{:04x} := 0x{:04x}", target, mask, desired),
            Record::PollUntilAck { target, timeout_ms } => {
                write!(f, "poll ack {} for {}ms", target, timeout_ms)
            }
            Record::DelayMs(ms) => write!(f, "delay {}ms", ms),
            Record::NvmData { target, words } => write!(f, "nvm data {} ({} words)", target, words.len()),
            Record::WriteEeData { target } => write!(f, "write ee data {}", target),
            Record::ReadAndVerifyEeData { target } => write!(f, "verify ee data {}", target),
            Record::Event(event) => write!(f, "event {:?}", event),
            Record::MetaData { kind, value } => match value {
                Some(value) => write!(f, "meta 0x{:02x} = 0x{:04x}", kind, value),
                None => write!(f, "meta 0x{:02x}", kind),
            },
            Record::Unsupported { kind, payload } => {
                write!(f, "unsupported 0x{:02x} ({} bytes)", kind, payload.len())
            }
            Record::Obsolete { kind, .. } => write!(f, "obsolete 0x{:02x}", kind),
            Record::EndOfRecords => write!(f, "end of records"),
        }
    }
}

/// Iterator of records over a hex image.
///
/// Yields `None` when the source ends cleanly between records and stops
/// after the first error.
pub struct Records<I> {
    decoder: HexDecoder<I>,
    failed: bool,
}

impl<I: Iterator<Item = u8>> Records<I> {
    pub fn new<S: IntoIterator<IntoIter = I>>(source: S) -> Self {
        Records {
            decoder: HexDecoder::new(source),
            failed: false,
        }
    }

    /// Hex lines consumed so far.
    pub fn lines(&self) -> usize {
        self.decoder.lines()
    }

    fn read(&mut self) -> Result<Option<Record>> {
        let Some(lo) = self.decoder.next_byte()? else {
            return Ok(None);
        };
        let mut header = [lo, 0, 0, 0];
        for byte in &mut header[1..] {
            *byte = self.decoder.require_byte()?;
        }
        let length = header[..].pread_with::<u16>(0, LE)? as usize;
        let kind = header[..].pread_with::<u16>(2, LE)?;
        if length > MAX_RECORD_SIZE {
            return Err(Error::RecordTooLarge { length, kind });
        }
        if length < HEADER_SIZE {
            return Err(Error::Malformed { kind, length });
        }
        let mut body = Vec::with_capacity(length - HEADER_SIZE);
        for _ in HEADER_SIZE..length {
            body.push(self.decoder.require_byte()?);
        }
        Record::parse(kind, &body).map(Some)
    }
}

impl<I: Iterator<Item = u8>> Iterator for Records<I> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::records_to_hex;
    use test_case::test_case;

    fn target(pec: Option<bool>) -> Target {
        Target {
            address: 0x5b,
            command: 0x10,
            pec,
        }
    }

    #[test]
    fn parse_write_byte() {
        let bytes = [0x09, 0x00, 0x01, 0x00, 0x5b, 0x00, 0x10, 0x01, 0xaa];
        let record = Record::parse(0x01, &bytes[4..]).unwrap();
        assert_eq!(
            record,
            Record::WriteByte {
                target: target(Some(true)),
                data: 0xaa
            }
        );
        assert_eq!(record.encode().unwrap(), bytes);
    }

    #[test]
    fn parse_word_without_pec_header() {
        let record = Record::parse(kind::WRITE_WORD_NOPEC, &[0x5b, 0x00, 0x10, 0x34, 0x12]).unwrap();
        assert_eq!(
            record,
            Record::WriteWord {
                target: target(None),
                data: 0x1234
            }
        );
    }

    #[test]
    fn loop_and_expect_mask_field_order() {
        let body = [0x5b, 0x00, 0xef, 0x40, 0x40];
        let looped = Record::parse(kind::READ_BYTE_LOOP_MASK_NOPEC, &body).unwrap();
        assert!(matches!(
            looped,
            Record::ReadByteLoopMask { mask: 0x40, expected: 0x40, .. }
        ));
        let body = [0x5b, 0x00, 0xef, 0x01, 0xf0];
        let masked = Record::parse(kind::READ_BYTE_EXPECT_MASK_NOPEC, &body).unwrap();
        assert!(matches!(
            masked,
            Record::ReadByteExpectMask { expected: 0x01, mask: 0xf0, .. }
        ));
    }

    #[test]
    fn modify_without_pec_ignores_flag() {
        let body = [0x40, 0x00, 0xd1, 0x01, 0x04, 0x00, 0x00, 0x00];
        let record = Record::parse(kind::MODIFY_WORD_NOPEC, &body).unwrap();
        let Record::ModifyWord { target, mask, desired } = record else {
            panic!("wrong record {:?}", record);
        };
        assert!(!target.uses_pec());
        assert_eq!((mask, desired), (0x0004, 0));
        assert_eq!(record.kind(), kind::MODIFY_WORD_NOPEC);
    }

    #[test]
    fn nvm_data_words() {
        let body = [0x40, 0x00, 0xbf, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05];
        let Record::NvmData { words, .. } = Record::parse(kind::NVM_DATA, &body).unwrap() else {
            panic!("not nvm data");
        };
        // Trailing odd byte is not a word.
        assert_eq!(words, [0x0201, 0x0403]);
    }

    #[test]
    fn meta_data_value_is_optional() {
        assert_eq!(
            Record::parse(kind::VARIABLE_META_DATA, &[0x01, 0x00]).unwrap(),
            Record::MetaData { kind: 1, value: None }
        );
        assert_eq!(
            Record::parse(kind::VARIABLE_META_DATA, &[0x00, 0x00, 0x60, 0x00]).unwrap(),
            Record::MetaData { kind: 0, value: Some(0x60) }
        );
    }

    #[test_case(0x00, Event::BeforeBegin)]
    #[test_case(0x04, Event::SystemAfterVerify)]
    #[test_case(0x12, Event::InSystemChipBeforeVerify)]
    fn events(id: u16, event: Event) {
        assert_eq!(Event::try_from(id).unwrap(), event);
        assert_eq!(u16::from(event), id);
    }

    #[test]
    fn unknown_event() {
        assert!(matches!(
            Record::parse(kind::EVENT, &[0x05, 0x00]),
            Err(Error::UnknownEvent(5))
        ));
    }

    #[test_case(kind::WRITE_BYTE, 4)]
    #[test_case(kind::WRITE_WORD_NOPEC, 4)]
    #[test_case(kind::DELAY_MS, 1)]
    #[test_case(kind::MODIFY_BYTE, 5)]
    #[test_case(kind::POLL_UNTIL_ACK_NOPEC, 3)]
    fn short_payloads(kind: u16, len: usize) {
        let body = vec![0u8; len];
        assert!(matches!(
            Record::parse(kind, &body),
            Err(Error::Malformed { length, .. }) if length == len + HEADER_SIZE
        ));
    }

    #[test_case(kind::WRITE_BLOCK)]
    #[test_case(kind::READ_BLOCK_EXPECT_NOPEC)]
    fn block_records_are_unsupported(kind: u16) {
        assert!(matches!(Record::parse(kind, &[1, 2, 3]), Ok(Record::Unsupported { .. })));
    }

    #[test]
    fn unknown_kind() {
        assert!(matches!(Record::parse(0x23, &[]), Err(Error::UnknownRecord(0x23))));
    }

    #[test]
    fn reader_walks_image() {
        let records = vec![
            Record::WriteByte {
                target: target(Some(false)),
                data: 0,
            },
            Record::DelayMs(50),
            Record::EndOfRecords,
        ];
        let text = records_to_hex(&records).unwrap();
        let parsed: Vec<_> = Records::new(text.bytes()).collect::<Result<_>>().unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn reader_rejects_oversized_record() {
        let text = ":0400000059020100A0\n";
        let mut records = Records::new(text.bytes());
        assert!(matches!(
            records.next(),
            Some(Err(Error::RecordTooLarge { length: 601, kind: 1 }))
        ));
        assert!(records.next().is_none());
    }

    #[test]
    fn reader_reports_truncation_mid_record() {
        // Header promises 9 bytes, only 6 present.
        let text = ":0600000009000100 5b00A0\n";
        let text = text.replace(' ', "");
        let mut records = Records::new(text.bytes());
        assert!(matches!(records.next(), Some(Err(Error::Truncated))));
    }

    #[test]
    fn reader_ends_cleanly_between_records() {
        let text = records_to_hex(&[Record::DelayMs(1)]).unwrap();
        let body: String = text.lines().next().unwrap().to_string();
        let parsed: Vec<_> = Records::new(body.bytes()).collect::<Result<_>>().unwrap();
        assert_eq!(parsed, [Record::DelayMs(1)]);
    }
}
