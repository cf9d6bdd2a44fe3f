//! Bus-wide discovery of devices and the rails they drive.
use crate::constants::commands;
use crate::device::{Device, Role};
use crate::pmbus::PmBus;
use crate::rail::Rail;
use crate::transport::Bus;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct Topology {
    devices: Vec<Device>,
    rails: Vec<Rail>,
}

impl Topology {
    /// Probes the bus, identifies every answering device and assembles rails.
    pub fn detect<B: Bus>(pmbus: &mut PmBus<B>) -> Result<Self> {
        let addresses = pmbus.smbus_mut().probe_unique(commands::PAGE)?;
        let mut devices = Vec::new();
        for address in addresses {
            if let Some(device) = Device::detect(pmbus, address)? {
                devices.push(device);
            }
        }
        Self::from_devices(pmbus, devices)
    }

    /// Builds rails for already identified devices.
    pub fn from_devices<B: Bus>(pmbus: &mut PmBus<B>, devices: Vec<Device>) -> Result<Self> {
        let mut topology = Topology {
            devices: Vec::with_capacity(devices.len()),
            rails: Vec::new(),
        };
        for device in devices {
            for rail in device.rails(pmbus)? {
                topology.add_rail(rail);
            }
            topology.devices.push(device);
        }
        log::info!(
            "{} devices, {} rails",
            topology.devices.len(),
            topology.rails.len()
        );
        Ok(topology)
    }

    fn add_rail(&mut self, rail: Rail) {
        match self.rails.iter_mut().find(|r| r.is_same_rail(&rail)) {
            Some(existing) => existing.merge(rail),
            None => self.rails.push(rail),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn rails(&self) -> &[Rail] {
        &self.rails
    }

    pub fn device(&self, address: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.address() == address)
    }

    /// The rail addressed by `address`, or the first rail touching a device
    /// at `address`.
    pub fn rail(&self, address: u8) -> Option<&Rail> {
        self.rails
            .iter()
            .find(|r| r.address() == address)
            .or_else(|| {
                self.rails
                    .iter()
                    .find(|r| r.fragments().iter().any(|f| f.address == address))
            })
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.devices.iter().map(Device::address).collect()
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.role() == Role::Controller)
    }

    pub fn managers(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.role() == Role::Manager)
    }
}
