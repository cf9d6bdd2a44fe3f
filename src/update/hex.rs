//! Pull decoder for the ASCII hex program image.
//!
//! Lines look like `:CCAAAATTdd..ddKK`. Data lines yield their bytes, the end
//! of file line yields a synthesized end-of-records record. The address and
//! checksum fields are not interpreted.
use crate::{Error, Result};

/// Longest data line accepted.
pub const LINE_CAPACITY: usize = 64;

/// `length = 4, type = END_OF_RECORDS`
const END_OF_RECORDS: [u8; 4] = [0x04, 0x00, 0x22, 0x00];

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;

pub struct HexDecoder<I> {
    source: I,
    line: [u8; LINE_CAPACITY],
    len: usize,
    pos: usize,
    lines: usize,
}

impl<I: Iterator<Item = u8>> HexDecoder<I> {
    pub fn new<S: IntoIterator<IntoIter = I>>(source: S) -> Self {
        HexDecoder {
            source: source.into_iter(),
            line: [0; LINE_CAPACITY],
            len: 0,
            pos: 0,
            lines: 0,
        }
    }

    /// Lines consumed so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Next decoded byte, `None` once the source ends between lines.
    pub fn next_byte(&mut self) -> Result<Option<u8>> {
        while self.pos == self.len {
            if !self.fill()? {
                return Ok(None);
            }
        }
        let byte = self.line[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Like [`next_byte`](Self::next_byte) but running out is an error.
    pub fn require_byte(&mut self) -> Result<u8> {
        self.next_byte()?.ok_or(Error::Truncated)
    }

    fn fill(&mut self) -> Result<bool> {
        // Anything before the start code, line endings included, is noise.
        loop {
            match self.source.next() {
                None => return Ok(false),
                Some(b':') => break,
                Some(_) => continue,
            }
        }
        self.lines += 1;
        self.pos = 0;
        self.len = 0;

        let count = self.hex_byte()? as usize;
        let _address = u16::from_be_bytes([self.hex_byte()?, self.hex_byte()?]);
        let line_type = self.hex_byte()?;

        match line_type {
            DATA => {
                if count > LINE_CAPACITY {
                    return Err(Error::LineTooLong(count));
                }
                for i in 0..count {
                    self.line[i] = self.hex_byte()?;
                }
                self.hex_byte()?;
                self.len = count;
            }
            END_OF_FILE => {
                for _ in 0..=count {
                    self.hex_byte()?;
                }
                self.line[..END_OF_RECORDS.len()].copy_from_slice(&END_OF_RECORDS);
                self.len = END_OF_RECORDS.len();
            }
            other => {
                log::debug!("skipping hex line type 0x{:02x}", other);
                for _ in 0..=count {
                    self.hex_byte()?;
                }
            }
        }
        Ok(true)
    }

    fn hex_byte(&mut self) -> Result<u8> {
        let pair = [
            self.source.next().ok_or(Error::Truncated)?,
            self.source.next().ok_or(Error::Truncated)?,
        ];
        let mut out = [0u8; 1];
        hex::decode_to_slice(pair, &mut out).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { c, .. } => Error::InvalidHex(c as u8),
            _ => Error::InvalidHex(pair[0]),
        })?;
        Ok(out[0])
    }
}
