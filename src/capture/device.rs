//! Process-wide registry of acquired capture devices
//!
//! A device can be held by one lease at a time; the lease gives it back when
//! dropped.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::DeviceError;
use crate::utils::lock;

static ACQUIRED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive hold on a capture device
#[derive(Debug)]
pub struct DeviceLease {
    id: String,
}

impl DeviceLease {
    /// Acquire `id`, failing with [`DeviceError::Busy`] if it is already held
    pub fn acquire(id: &str) -> Result<Self, DeviceError> {
        if !lock(&ACQUIRED).insert(id.to_string()) {
            return Err(DeviceError::Busy(id.to_string()));
        }
        log::debug!("DeviceLease: acquired {}", id);
        Ok(Self { id: id.to_string() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        lock(&ACQUIRED).remove(&self.id);
        log::debug!("DeviceLease: released {}", self.id);
    }
}

/// Check whether a device is currently held
pub fn is_acquired(id: &str) -> bool {
    lock(&ACQUIRED).contains(id)
}
