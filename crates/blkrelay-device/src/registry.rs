//! Tracking live relay devices by name.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::RelayDevice;
use crate::error::RegistryError;

/// Where a relay device announces itself on creation and withdraws on delete.
///
/// Registration is the last step of device creation, so a device visible
/// through a registry is always ready to accept requests.
pub trait DeviceRegistry: Send + Sync {
    fn register(&self, device: &Arc<RelayDevice>) -> Result<(), RegistryError>;

    /// Withdraw `name`. Unknown names are ignored.
    fn deregister(&self, name: &str);
}

/// Name-keyed table of live devices.
#[derive(Default)]
pub struct DeviceTable {
    devices: Mutex<HashMap<String, Arc<RelayDevice>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RelayDevice>> {
        self.devices
            .lock()
            .expect("mutex poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .lock()
            .expect("mutex poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.devices.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRegistry for DeviceTable {
    fn register(&self, device: &Arc<RelayDevice>) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().expect("mutex poisoned");
        match devices.entry(device.name().to_owned()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateName(device.name().to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(device.clone());
                Ok(())
            }
        }
    }

    fn deregister(&self, name: &str) {
        self.devices.lock().expect("mutex poisoned").remove(name);
    }
}
