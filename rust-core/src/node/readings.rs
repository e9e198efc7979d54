// Last value each local device reported, keyed by (device id, sensor id).
// Filled from device replies, read by the reading server when peers ask.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Default)]
pub struct ReadingCache {
    values: RwLock<HashMap<(String, String), Value>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device_id: &str, sensor_id: &str, value: Value) {
        self.values
            .write()
            .insert((device_id.to_string(), sensor_id.to_string()), value);
    }

    /// Records every `sensorId -> value` entry of a reply body; non-object bodies are ignored.
    pub fn record_body(&self, device_id: &str, body: &Value) -> usize {
        let Some(map) = body.as_object() else {
            return 0;
        };
        let mut values = self.values.write();
        for (sensor_id, value) in map {
            values.insert((device_id.to_string(), sensor_id.clone()), value.clone());
        }
        map.len()
    }

    /// `None` when the device never reported this sensor or reported JSON null.
    pub fn latest(&self, device_id: &str, sensor_id: &str) -> Option<Value> {
        self.values
            .read()
            .get(&(device_id.to_string(), sensor_id.to_string()))
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Drops readings of devices that are no longer attached.
    pub fn retain_devices<F: Fn(&str) -> bool>(&self, keep: F) {
        self.values.write().retain(|(device, _), _| keep(device));
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
