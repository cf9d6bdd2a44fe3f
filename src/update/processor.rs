//! Executes decoded records against the bus.
use std::time::Duration;

use super::record::{meta, Record, Records, Target};
use super::session::{Mode, Session};
use crate::constants::{commands, mfr_common, nvm_key, GLOBAL_ADDRESS};
use crate::pmbus::PmBus;
use crate::smbus::{Poll, PollConfig, SmBus};
use crate::transport::Bus;
use crate::{Error, Result};

/// `WRITE_PROTECT` value opening every register, NVM included.
const UNPROTECT_ALL: u16 = 0xc000;

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Records read, terminator included.
    pub records: usize,
    /// Records passed over while a verify run was outside its window.
    pub skipped: usize,
    /// Hex lines consumed.
    pub lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

pub struct Processor<'a, B: Bus> {
    pmbus: &'a mut PmBus<B>,
    session: Session,
}

impl<'a, B: Bus> Processor<'a, B> {
    pub fn new(pmbus: &'a mut PmBus<B>, mode: Mode) -> Self {
        Processor {
            pmbus,
            session: Session::new(mode),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Runs a hex image to its end-of-records marker.
    pub fn run<S: IntoIterator<Item = u8>>(&mut self, image: S) -> Result<Outcome> {
        self.run_with(image, |_| {})
    }

    /// Like [`run`](Self::run), calling `on_record` before each record.
    pub fn run_with<S: IntoIterator<Item = u8>>(
        &mut self,
        image: S,
        mut on_record: impl FnMut(&Record),
    ) -> Result<Outcome> {
        let mut records = Records::new(image);
        let mut outcome = Outcome::default();
        while let Some(record) = records.next() {
            let record = record?;
            outcome.records += 1;
            on_record(&record);
            if !self.session.admits(&record) {
                log::trace!("skip {}", record);
                outcome.skipped += 1;
                continue;
            }
            if self.process(&record)? == Flow::Done {
                outcome.lines = records.lines();
                log::info!(
                    "{:?} finished: {} records, {} skipped",
                    self.session.mode(),
                    outcome.records,
                    outcome.skipped
                );
                return Ok(outcome);
            }
        }
        Err(Error::Truncated)
    }

    /// Executes one record, ignoring the verify window.
    pub fn process(&mut self, record: &Record) -> Result<Flow> {
        log::debug!("{}", record);
        let verify = self.session.mode() == Mode::Verify;
        let smbus = self.pmbus.smbus_mut();

        match record {
            // Verification must never erase: the erase becomes a lock.
            Record::WriteByte { target, .. }
                if verify && target.pec.is_some() && target.command == commands::MFR_EE_ERASE =>
            {
                lock_nvm(smbus, target.address)?
            }
            Record::WriteByte { target, data } => {
                smbus.with_pec(target.uses_pec(), |s| s.write_byte(target.address, target.command, *data))?
            }
            Record::WriteWord { target, data } => {
                smbus.with_pec(target.uses_pec(), |s| s.write_word(target.address, target.command, *data))?
            }
            Record::SendByte { target } => {
                smbus.with_pec(target.uses_pec(), |s| s.send_byte(target.address, target.command))?
            }
            Record::ReadByteExpect { target, expected } => {
                let actual = read_byte(smbus, target)?;
                expect(target, *expected as u16, actual as u16)?;
            }
            Record::ReadWordExpect { target, expected } => {
                let actual = read_word(smbus, target)?;
                expect(target, *expected, actual)?;
            }
            Record::ReadByteExpectMask {
                target,
                expected,
                mask,
            } => {
                let actual = read_byte(smbus, target)?;
                expect(target, (*expected & *mask) as u16, (actual & *mask) as u16)?;
            }
            Record::ReadWordExpectMask {
                target,
                expected,
                mask,
            } => {
                let actual = read_word(smbus, target)?;
                expect(target, *expected & *mask, actual & *mask)?;
            }
            Record::ReadByteLoopMask {
                target,
                mask,
                expected,
            } => loop_until(smbus, target, |s| {
                Ok(read_byte(s, target)? & *mask == *expected & *mask)
            })?,
            Record::ReadWordLoopMask {
                target,
                mask,
                expected,
            } => loop_until(smbus, target, |s| {
                Ok(read_word(s, target)? & *mask == *expected & *mask)
            })?,
            Record::ModifyByte {
                target,
                mask,
                desired,
            } => smbus.with_pec(target.uses_pec(), |s| {
                let current = s.read_byte(target.address, target.command)?;
                s.write_byte(target.address, target.command, (current & !*mask) | (*desired & *mask))
            })?,
            Record::ModifyWord {
                target,
                mask,
                desired,
            } => smbus.with_pec(target.uses_pec(), |s| {
                let current = s.read_word(target.address, target.command)?;
                s.write_word(target.address, target.command, (current & !*mask) | (*desired & *mask))
            })?,
            Record::PollUntilAck { target, timeout_ms } => {
                let saved = smbus.poll_config();
                if *timeout_ms > 0 {
                    smbus.set_poll_config(PollConfig {
                        deadline: Some(Duration::from_millis(*timeout_ms as u64)),
                        ..saved
                    });
                }
                let polled = smbus.with_pec(false, |s| s.wait_for_ack(target.address, target.command));
                smbus.set_poll_config(saved);
                polled?
            }
            Record::DelayMs(ms) => smbus.delay(Duration::from_millis(*ms as u64)),
            Record::NvmData { words, .. } => {
                log::debug!("staged {} NVM words", words.len());
                self.session.nvm_mut().load(words.clone());
            }
            Record::WriteEeData { target } if verify => lock_nvm(smbus, target.address)?,
            Record::WriteEeData { target } => {
                self.session.nvm_mut().arm();
                write_ee_data(smbus, target, self.session.nvm().words())?
            }
            Record::ReadAndVerifyEeData { target } => {
                if self.session.nvm_mut().take_armed() {
                    verify_ee_data(smbus, target, self.session.nvm().words())?
                }
            }
            Record::Event(event) => {
                log::info!("event {:?}", event);
                self.session.on_event(*event);
            }
            Record::MetaData { kind, value } => match *kind {
                meta::SET_GLOBAL_BASE_ADDRESS => {
                    let value = value.ok_or(Error::Malformed {
                        kind: record.kind(),
                        length: 6,
                    })?;
                    smbus.with_pec(false, |s| {
                        s.wait_for_ack(GLOBAL_ADDRESS, commands::PAGE)?;
                        s.write_word(GLOBAL_ADDRESS, commands::WRITE_PROTECT, UNPROTECT_ALL)?;
                        s.write_word(GLOBAL_ADDRESS, commands::MFR_ADDRESS, value)
                    })?
                }
                meta::OEM_SERIAL_NUMBER => {}
                other => return Err(Error::UnknownMetaData(other)),
            },
            Record::Unsupported { kind, .. } => return Err(Error::UnsupportedRecord(*kind)),
            Record::Obsolete { kind, .. } => log::debug!("ignoring obsolete record 0x{:02x}", kind),
            Record::EndOfRecords => return Ok(Flow::Done),
        }
        Ok(Flow::Continue)
    }
}

fn lock_nvm<B: Bus>(smbus: &mut SmBus<B>, address: u8) -> Result<()> {
    log::debug!("verify: locking NVM of 0x{:02x}", address);
    smbus.with_pec(true, |s| s.write_byte(address, commands::MFR_EE_UNLOCK, nvm_key::LOCK))
}

fn read_byte<B: Bus>(smbus: &mut SmBus<B>, target: &Target) -> Result<u8> {
    smbus.with_pec(target.uses_pec(), |s| s.read_byte(target.address, target.command))
}

fn read_word<B: Bus>(smbus: &mut SmBus<B>, target: &Target) -> Result<u16> {
    smbus.with_pec(target.uses_pec(), |s| s.read_word(target.address, target.command))
}

fn expect(target: &Target, expected: u16, actual: u16) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ExpectMismatch {
            address: target.address,
            command: target.command,
            expected,
            actual,
        })
    }
}

/// Re-reads until `done` holds, transient NACK and PEC failures included.
fn loop_until<B: Bus>(
    smbus: &mut SmBus<B>,
    target: &Target,
    mut done: impl FnMut(&mut SmBus<B>) -> Result<bool>,
) -> Result<()> {
    let config = smbus.poll_config();
    let mut poll = Poll::new(config.not_busy_attempts, config.deadline);
    while poll.attempt() {
        match done(&mut *smbus) {
            Ok(true) => return Ok(()),
            Ok(false) | Err(Error::Nack { .. }) | Err(Error::Pec { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Timeout {
        address: target.address,
        what: "masked value",
    })
}

/// Waits for `MFR_COMMON` to report the NVM engine idle.
fn wait_not_busy<B: Bus>(smbus: &mut SmBus<B>, target: &Target) -> Result<()> {
    loop_until(smbus, target, |s| {
        let common = s.read_byte(target.address, commands::MFR_COMMON)?;
        Ok(common & mfr_common::NOT_BUSY != 0)
    })
    .map_err(|e| match e {
        Error::Timeout { address, .. } => Error::Timeout {
            address,
            what: "NVM not busy",
        },
        e => e,
    })
}

fn write_ee_data<B: Bus>(smbus: &mut SmBus<B>, target: &Target, words: &[u16]) -> Result<()> {
    log::info!("writing {} NVM words to 0x{:02x}", words.len(), target.address);
    smbus.with_pec(target.uses_pec(), |s| {
        for word in words {
            s.write_word(target.address, target.command, *word)?;
            wait_not_busy(s, target)?;
        }
        Ok(())
    })
}

fn verify_ee_data<B: Bus>(smbus: &mut SmBus<B>, target: &Target, words: &[u16]) -> Result<()> {
    log::info!("verifying {} NVM words on 0x{:02x}", words.len(), target.address);
    smbus.with_pec(target.uses_pec(), |s| {
        for (index, expected) in words.iter().enumerate() {
            let actual = s.read_word(target.address, target.command)?;
            if actual != *expected {
                return Err(Error::VerifyMismatch {
                    address: target.address,
                    command: target.command,
                    index,
                    expected: *expected,
                    actual,
                });
            }
            wait_not_busy(s, target)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockBus, Op};
    use crate::format::records_to_hex;
    use crate::update::record::{kind, Event};
    use test_case::test_case;

    fn target(address: u8, command: u8, pec: Option<bool>) -> Target {
        Target {
            address,
            command,
            pec,
        }
    }

    fn pmbus(mock: MockBus) -> PmBus<MockBus> {
        PmBus::new(SmBus::new(mock)).unwrap()
    }

    fn run(mock: MockBus, mode: Mode, records: &[Record]) -> (Result<Outcome>, MockBus) {
        let mut pmbus = pmbus(mock);
        let image = records_to_hex(records).unwrap();
        let outcome = Processor::new(&mut pmbus, mode).run(image.bytes());
        (outcome, pmbus.into_inner().into_inner())
    }

    fn scenario() -> Vec<Record> {
        vec![
            Record::WriteByte {
                target: target(0x5b, 0x10, Some(false)),
                data: 0,
            },
            Record::DelayMs(50),
            Record::EndOfRecords,
        ]
    }

    #[test]
    fn program_issues_write_and_delay() {
        let (outcome, mock) = run(MockBus::new().with_device(0x5b), Mode::Program, &scenario());
        assert_eq!(outcome.unwrap().records, 3);
        assert_eq!(mock.writes(), [(0x5b, vec![0x10, 0x00])]);
        assert_eq!(mock.delays(), [Duration::from_millis(50)]);
    }

    #[test]
    fn verify_outside_window_touches_nothing() {
        let mut records = vec![Record::Event(Event::BeforeBegin)];
        records.extend(scenario());
        let (outcome, mock) = run(MockBus::new().with_device(0x5b), Mode::Verify, &records);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.records, 4);
        assert_eq!(outcome.skipped, 2);
        assert!(mock.writes().is_empty());
        assert!(mock.delays().is_empty());
    }

    #[test]
    fn verify_inside_window_runs_records() {
        let mut records = vec![Record::Event(Event::InSystemChipBeforeVerify)];
        records.extend(scenario());
        let (outcome, mock) = run(MockBus::new().with_device(0x5b), Mode::Verify, &records);
        assert_eq!(outcome.unwrap().skipped, 0);
        assert_eq!(mock.writes().len(), 1);
    }

    #[test]
    fn missing_terminator_is_truncated() {
        let mut pmbus = pmbus(MockBus::new().with_device(0x5b));
        let image = records_to_hex(&[Record::DelayMs(1)]).unwrap();
        let image: String = image.lines().next().unwrap().into();
        assert!(matches!(
            Processor::new(&mut pmbus, Mode::Program).run(image.bytes()),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn verify_redirects_erase_to_lock() {
        let mut processor_bus = pmbus(MockBus::new().with_device(0x40));
        let mut processor = Processor::new(&mut processor_bus, Mode::Verify);
        processor
            .process(&Record::WriteByte {
                target: target(0x40, commands::MFR_EE_ERASE, Some(false)),
                data: nvm_key::ERASE,
            })
            .unwrap();
        let mock = processor_bus.smbus().bus();
        // PEC framed lock, the erase itself never goes out.
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1[..2], [commands::MFR_EE_UNLOCK, nvm_key::LOCK]);
        assert_eq!(writes[0].1.len(), 3);
    }

    #[test]
    fn verify_does_not_redirect_erase_without_pec_flag() {
        let mut pmbus = pmbus(MockBus::new().with_device(0x40));
        Processor::new(&mut pmbus, Mode::Verify)
            .process(&Record::WriteByte {
                target: target(0x40, commands::MFR_EE_ERASE, None),
                data: nvm_key::ERASE,
            })
            .unwrap();
        assert_eq!(
            pmbus.smbus().bus().writes(),
            [(0x40, vec![commands::MFR_EE_ERASE, nvm_key::ERASE])]
        );
    }

    #[test]
    fn write_word_with_pec() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.pec = true;
        let mut pmbus = pmbus(mock);
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::WriteWord {
                target: target(0x40, commands::VOUT_COMMAND, Some(true)),
                data: 0x1234,
            })
            .unwrap();
        assert_eq!(
            pmbus.smbus().bus().value(0x40, commands::VOUT_COMMAND),
            Some(&[0x34, 0x12][..])
        );
    }

    #[test_case(0x12, Ok(()))]
    #[test_case(0x13, Err(0x12))]
    fn read_byte_expect(expected: u8, result: std::result::Result<(), u16>) {
        let mut mock = MockBus::new().with_device(0x40);
        mock.set(0x40, commands::STATUS_BYTE, &[0x12]);
        let mut pmbus = pmbus(mock);
        let outcome = Processor::new(&mut pmbus, Mode::Program).process(&Record::ReadByteExpect {
            target: target(0x40, commands::STATUS_BYTE, None),
            expected,
        });
        match result {
            Ok(()) => assert_eq!(outcome.unwrap(), Flow::Continue),
            Err(actual) => assert!(matches!(
                outcome,
                Err(Error::ExpectMismatch { actual: a, .. }) if a == actual
            )),
        }
    }

    #[test]
    fn read_word_expect_mask() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.set_word(0x40, commands::MFR_SPECIAL_ID, 0x4022);
        let mut pmbus = pmbus(mock);
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::ReadWordExpectMask {
                target: target(0x40, commands::MFR_SPECIAL_ID, None),
                expected: 0x4020,
                mask: 0xfff0,
            })
            .unwrap();
    }

    #[test]
    fn loop_mask_waits_for_match() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.script(0x40, commands::MFR_COMMON, &[&[0x00], &[0x00], &[0x40]]);
        let mut pmbus = pmbus(mock);
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::ReadByteLoopMask {
                target: target(0x40, commands::MFR_COMMON, None),
                mask: 0x40,
                expected: 0x40,
            })
            .unwrap();
        assert_eq!(pmbus.smbus().bus().ops.len(), 3);
    }

    #[test]
    fn loop_mask_is_bounded() {
        let mut smbus = SmBus::new(MockBus::new().with_device(0x40));
        smbus.set_poll_config(PollConfig {
            not_busy_attempts: 4,
            ..Default::default()
        });
        let mut pmbus = PmBus::new(smbus).unwrap();
        let outcome = Processor::new(&mut pmbus, Mode::Program).process(&Record::ReadWordLoopMask {
            target: target(0x40, commands::STATUS_WORD, Some(false)),
            mask: 0x0001,
            expected: 0x0001,
        });
        assert!(matches!(outcome, Err(Error::Timeout { address: 0x40, .. })));
        assert_eq!(pmbus.smbus().bus().ops.len(), 4);
    }

    #[test]
    fn modify_byte_keeps_unmasked_bits() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.set(0x40, commands::ON_OFF_CONFIG, &[0b1010_1010]);
        let mut pmbus = pmbus(mock);
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::ModifyByte {
                target: target(0x40, commands::ON_OFF_CONFIG, None),
                mask: 0x0f,
                desired: 0x05,
            })
            .unwrap();
        assert_eq!(
            pmbus.smbus().bus().value(0x40, commands::ON_OFF_CONFIG),
            Some(&[0b1010_0101][..])
        );
    }

    #[test]
    fn nvm_write_then_verify() {
        let words = vec![0x1111, 0x2222, 0x3333];
        let mut mock = MockBus::new().with_device(0x40);
        mock.script(
            0x40,
            commands::MFR_EE_DATA,
            &[&[0x11, 0x11], &[0x22, 0x22], &[0x33, 0x33]],
        );
        let mut pmbus = pmbus(mock);
        let nvm = target(0x40, commands::MFR_EE_DATA, Some(false));
        let mut processor = Processor::new(&mut pmbus, Mode::Program);
        processor
            .process(&Record::NvmData {
                target: nvm,
                words: words.clone(),
            })
            .unwrap();
        processor.process(&Record::WriteEeData { target: nvm }).unwrap();
        processor
            .process(&Record::ReadAndVerifyEeData { target: nvm })
            .unwrap();
        assert!(!processor.session().nvm().is_armed());
        // Disarmed: a second verify passes without reading.
        processor
            .process(&Record::ReadAndVerifyEeData { target: nvm })
            .unwrap();

        let writes = pmbus.smbus().bus().writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[1], (0x40, vec![commands::MFR_EE_DATA, 0x22, 0x22]));
    }

    #[test]
    fn verify_mismatch_reports_index() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.script(0x40, commands::MFR_EE_DATA, &[&[0x01, 0x00], &[0xff, 0x00]]);
        let mut pmbus = pmbus(mock);
        let nvm = target(0x40, commands::MFR_EE_DATA, Some(false));
        let mut processor = Processor::new(&mut pmbus, Mode::Verify);
        processor
            .process(&Record::NvmData {
                target: nvm,
                words: vec![0x0001, 0x0002],
            })
            .unwrap();
        assert!(matches!(
            processor.process(&Record::ReadAndVerifyEeData { target: nvm }),
            Err(Error::VerifyMismatch {
                index: 1,
                expected: 2,
                actual: 0xff,
                ..
            })
        ));
    }

    fn staged_while_suppressed() -> Vec<Record> {
        let nvm = target(0x40, commands::MFR_EE_DATA, Some(false));
        vec![
            Record::Event(Event::BeforeBegin),
            Record::NvmData {
                target: nvm,
                words: vec![0x1234, 0x5678],
            },
            Record::WriteEeData { target: nvm },
            Record::Event(Event::InSystemChipBeforeVerify),
            Record::ReadAndVerifyEeData { target: nvm },
            Record::EndOfRecords,
        ]
    }

    #[test]
    fn nvm_data_staged_while_verify_suppressed() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.script(0x40, commands::MFR_EE_DATA, &[&[0x34, 0x12], &[0x78, 0x56]]);
        let (outcome, mock) = run(mock, Mode::Verify, &staged_while_suppressed());
        let outcome = outcome.unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(mock.writes().is_empty());
        let reads = mock
            .ops
            .iter()
            .filter(|op| matches!(op, Op::WriteRead { bytes, .. } if bytes[0] == commands::MFR_EE_DATA))
            .count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn staged_nvm_data_catches_mismatch() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.script(0x40, commands::MFR_EE_DATA, &[&[0x34, 0x12], &[0x00, 0x56]]);
        let (outcome, _) = run(mock, Mode::Verify, &staged_while_suppressed());
        assert!(matches!(
            outcome,
            Err(Error::VerifyMismatch {
                index: 1,
                expected: 0x5678,
                actual: 0x5600,
                ..
            })
        ));
    }

    #[test]
    fn verify_write_ee_data_only_locks() {
        let mut pmbus = pmbus(MockBus::new().with_device(0x40));
        let nvm = target(0x40, commands::MFR_EE_DATA, Some(false));
        let mut processor = Processor::new(&mut pmbus, Mode::Verify);
        processor
            .process(&Record::NvmData {
                target: nvm,
                words: vec![1, 2, 3],
            })
            .unwrap();
        processor.process(&Record::WriteEeData { target: nvm }).unwrap();
        let writes = pmbus.smbus().bus().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1[0], commands::MFR_EE_UNLOCK);
    }

    #[test]
    fn global_base_address_meta() {
        let mut pmbus = pmbus(MockBus::new().with_device(GLOBAL_ADDRESS));
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::MetaData {
                kind: meta::SET_GLOBAL_BASE_ADDRESS,
                value: Some(0x0060),
            })
            .unwrap();
        assert_eq!(
            pmbus.smbus().bus().writes(),
            [
                (GLOBAL_ADDRESS, vec![commands::WRITE_PROTECT, 0x00, 0xc0]),
                (GLOBAL_ADDRESS, vec![commands::MFR_ADDRESS, 0x60, 0x00]),
            ]
        );
    }

    #[test]
    fn unknown_meta_data() {
        let mut pmbus = pmbus(MockBus::new());
        assert!(matches!(
            Processor::new(&mut pmbus, Mode::Program).process(&Record::MetaData { kind: 7, value: None }),
            Err(Error::UnknownMetaData(7))
        ));
    }

    #[test]
    fn block_records_fail() {
        let mut pmbus = pmbus(MockBus::new());
        assert!(matches!(
            Processor::new(&mut pmbus, Mode::Program).process(&Record::Unsupported {
                kind: kind::WRITE_BLOCK,
                payload: vec![]
            }),
            Err(Error::UnsupportedRecord(kind::WRITE_BLOCK))
        ));
    }

    #[test]
    fn poll_until_ack_restores_poll_config() {
        let mut mock = MockBus::new().with_device(0x40);
        mock.nack(0x40, 2);
        let mut pmbus = pmbus(mock);
        Processor::new(&mut pmbus, Mode::Program)
            .process(&Record::PollUntilAck {
                target: target(0x40, commands::PAGE, None),
                timeout_ms: 100,
            })
            .unwrap();
        assert_eq!(pmbus.smbus().poll_config(), PollConfig::default());
        assert!(pmbus
            .smbus()
            .bus()
            .ops
            .iter()
            .all(|op| matches!(op, Op::WriteRead { address: 0x40, .. })));
    }
}
