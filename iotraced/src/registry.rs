use std::collections::HashMap;
use std::sync::RwLock;

use iotrace_common::{encode_dev_id, MAX_TRACED_DEVICES};

use crate::error::IoTraceError;

#[derive(Debug, Clone)]
pub struct TracedDevice {
    pub dev_id: u64,
    pub path: String,
    pub major: u32,
    pub minor: u32,
}

/// Userspace mirror of the devices currently announced to the eBPF
/// producer's per-CPU registry. `add`/`remove` are the control-plane
/// entrypoints; the actual broadcast to kernel maps happens one layer up,
/// in the daemon's eBPF handle, so this type stays free of any aya
/// dependency and is cheaply unit-testable.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<u64, TracedDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: &str, major: u32, minor: u32) -> Result<TracedDevice, IoTraceError> {
        let dev_id = encode_dev_id(major, minor);
        let mut devices = self.devices.write().expect("registry lock poisoned");
        if devices.contains_key(&dev_id) {
            return Ok(devices[&dev_id].clone());
        }
        if devices.len() >= MAX_TRACED_DEVICES {
            return Err(IoTraceError::DeviceRegistryFull {
                max: MAX_TRACED_DEVICES,
            });
        }
        let device = TracedDevice {
            dev_id,
            path: path.to_string(),
            major,
            minor,
        };
        devices.insert(dev_id, device.clone());
        Ok(device)
    }

    pub fn remove(&self, dev_id: u64) -> Result<(), IoTraceError> {
        let mut devices = self.devices.write().expect("registry lock poisoned");
        devices
            .remove(&dev_id)
            .map(|_| ())
            .ok_or_else(|| IoTraceError::DeviceNotFound(format!("{dev_id:#x}")))
    }

    pub fn is_traced(&self, dev_id: u64) -> bool {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .contains_key(&dev_id)
    }

    pub fn list(&self) -> Vec<TracedDevice> {
        let mut out: Vec<_> = self
            .devices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|d| d.dev_id);
        out
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_list() {
        let reg = DeviceRegistry::new();
        reg.add("/dev/sda", 8, 0).unwrap();
        reg.add("/dev/sdb", 8, 16).unwrap();
        assert_eq!(reg.len(), 2);
        let listed = reg.list();
        assert_eq!(listed[0].path, "/dev/sda");
    }

    #[test]
    fn add_is_idempotent() {
        let reg = DeviceRegistry::new();
        let a = reg.add("/dev/sda", 8, 0).unwrap();
        let b = reg.add("/dev/sda", 8, 0).unwrap();
        assert_eq!(a.dev_id, b.dev_id);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_unknown_errors() {
        let reg = DeviceRegistry::new();
        assert!(matches!(
            reg.remove(0xdead),
            Err(IoTraceError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn registry_has_bounded_capacity() {
        let reg = DeviceRegistry::new();
        for i in 0..MAX_TRACED_DEVICES as u32 {
            reg.add(&format!("/dev/loop{i}"), 7, i).unwrap();
        }
        let err = reg.add("/dev/loop99", 7, 99).unwrap_err();
        assert!(matches!(err, IoTraceError::DeviceRegistryFull { .. }));
    }

    #[test]
    fn is_traced_reflects_membership() {
        let reg = DeviceRegistry::new();
        let dev = reg.add("/dev/sda", 8, 0).unwrap();
        assert!(reg.is_traced(dev.dev_id));
        reg.remove(dev.dev_id).unwrap();
        assert!(!reg.is_traced(dev.dev_id));
    }
}
