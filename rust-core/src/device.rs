// Devices attached to this node, as reported by the device registry.
// The node only mirrors ids and sensor lists; the registry stays authoritative.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
}

impl Device {
    pub fn new(id: &str, sensors: &[(&str, &str)]) -> Self {
        Self {
            id: id.to_string(),
            sensors: sensors
                .iter()
                .map(|(id, ty)| Sensor {
                    id: id.to_string(),
                    sensor_type: ty.to_string(),
                })
                .collect(),
        }
    }

    pub fn sensors_of_type<'a>(&'a self, sensor_type: &'a str) -> impl Iterator<Item = &'a Sensor> + 'a {
        self.sensors.iter().filter(move |s| s.sensor_type == sensor_type)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("device registry format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("device registry unavailable: {0}")]
    Unavailable(String),
}

pub trait DeviceRegistry: Send + Sync {
    fn all_devices(&self) -> Result<Vec<Device>, RegistryError>;
}

/// Drops repeated device ids and repeated sensor ids within a device (first wins).
pub fn dedupe_devices(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(devices.len());
    for mut d in devices {
        if !seen.insert(d.id.clone()) {
            warn!(device = %d.id, "duplicate device id from registry; ignoring");
            continue;
        }
        let mut sensor_ids = HashSet::new();
        d.sensors.retain(|s| sensor_ids.insert(s.id.clone()));
        out.push(d);
    }
    out
}

/// In-memory registry; contents are replaced wholesale.
#[derive(Default)]
pub struct StaticDeviceRegistry {
    devices: RwLock<Vec<Device>>,
    failing: RwLock<Option<String>>,
}

impl StaticDeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: RwLock::new(devices),
            failing: RwLock::new(None),
        }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.write() = devices;
    }

    /// Makes subsequent fetches fail with `reason` (`None` restores service).
    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failing.write() = reason.map(str::to_string);
    }
}

impl DeviceRegistry for StaticDeviceRegistry {
    fn all_devices(&self) -> Result<Vec<Device>, RegistryError> {
        if let Some(reason) = self.failing.read().as_ref() {
            return Err(RegistryError::Unavailable(reason.clone()));
        }
        Ok(self.devices.read().clone())
    }
}

/// Registry backed by a JSON file holding a list of devices; re-read on every fetch.
pub struct FileDeviceRegistry {
    path: PathBuf,
}

impl FileDeviceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceRegistry for FileDeviceRegistry {
    fn all_devices(&self) -> Result<Vec<Device>, RegistryError> {
        let data = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
