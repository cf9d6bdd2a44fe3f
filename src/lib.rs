//! PMBus power system management.
//!
//! Layers, bottom up: a byte [`transport::Bus`], SMBus transactions with PEC
//! and group framing ([`smbus`]), PMBus commands ([`pmbus`]), device and rail
//! topology ([`device`], [`rail`], [`topology`]) and the in-field NVM update
//! engine ([`update`]).

pub mod constants;
pub mod device;
pub mod error;
pub mod format;
pub mod math;
pub mod pec;
pub mod pmbus;
pub mod protocol;
pub mod rail;
pub mod smbus;
pub mod topology;
pub mod transport;
pub mod update;

pub use self::device::{Device, DeviceDb};
pub use self::error::{Error, Result};
pub use self::pmbus::PmBus;
pub use self::rail::Rail;
pub use self::smbus::SmBus;
pub use self::topology::Topology;
pub use self::transport::{Bus, Transport};
