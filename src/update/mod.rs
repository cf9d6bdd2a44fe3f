//! In-field update of power devices from an ASCII hex record image.
//!
//! The image is decoded lazily line by line, records are executed as soon as
//! they are complete. A verify run executes only the verification sections
//! and turns any NVM write into a lock so the parts are never reprogrammed.
pub mod hex;
pub mod processor;
pub mod record;
pub mod session;

pub use self::processor::{Outcome, Processor};
pub use self::record::{Event, Record, Records, Target};
pub use self::session::Mode;

use crate::pmbus::PmBus;
use crate::transport::Bus;
use crate::Result;

/// Programs every device the image addresses.
pub fn program<B: Bus>(pmbus: &mut PmBus<B>, image: impl IntoIterator<Item = u8>) -> Result<Outcome> {
    Processor::new(pmbus, Mode::Program).run(image)
}

/// Checks the devices against the image without changing their NVM.
pub fn verify<B: Bus>(pmbus: &mut PmBus<B>, image: impl IntoIterator<Item = u8>) -> Result<Outcome> {
    Processor::new(pmbus, Mode::Verify).run(image)
}
