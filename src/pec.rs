//! SMBus Packet Error Code.
//!
//! CRC-8 with polynomial x^8 + x^2 + x + 1, initial value zero, computed over
//! every byte on the wire including the address bytes.

use crc::{CRC_8_SMBUS, Crc, Digest};

static SMBUS_PEC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Running PEC over a transaction.
pub struct Pec {
    digest: Digest<'static, u8>,
}

impl Pec {
    pub fn new() -> Self {
        Pec {
            digest: SMBUS_PEC.digest(),
        }
    }

    /// Starts a PEC for a write to `address`.
    pub fn write(address: u8) -> Self {
        let mut pec = Self::new();
        pec.push(address << 1);
        pec
    }

    pub fn push(&mut self, byte: u8) {
        self.digest.update(&[byte]);
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Adds the read address byte emitted after a repeated start.
    pub fn restart_read(&mut self, address: u8) {
        self.push((address << 1) | 1);
    }

    pub fn finish(self) -> u8 {
        self.digest.finalize()
    }
}

impl Default for Pec {
    fn default() -> Self {
        Self::new()
    }
}

/// PEC of a single contiguous run of bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    SMBUS_PEC.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[], 0x00; "empty")]
    #[test_case(b"123456789", 0xf4; "check value")]
    #[test_case(&[0xb6, 0x03], 0x38; "clear faults at 0x5b")]
    fn known_values(data: &[u8], expected: u8) {
        assert_eq!(checksum(data), expected);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut pec = Pec::write(0x40);
        pec.push(0x21);
        pec.extend(&[0x00, 0x20]);
        assert_eq!(pec.finish(), checksum(&[0x80, 0x21, 0x00, 0x20]));
    }

    #[test]
    fn read_address_has_low_bit_set() {
        let mut pec = Pec::write(0x30);
        pec.push(0x79);
        pec.restart_read(0x30);
        pec.push(0x42);
        assert_eq!(pec.finish(), checksum(&[0x60, 0x79, 0x61, 0x42]));
    }

    #[test]
    fn single_bit_flip_detected() {
        let frame = [0x80u8, 0x21, 0x00, 0x20];
        let pec = checksum(&frame);
        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[i] ^= 1 << bit;
                assert_ne!(checksum(&corrupted), pec, "byte {i} bit {bit}");
            }
        }
        for bit in 0..8 {
            assert_ne!(pec ^ (1 << bit), checksum(&frame));
        }
    }
}
