use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const UNKNOWN: &str = "unknown";

/// Device identity -> detection-type lookup, loaded once and read-only after.
/// An entry is either a plain string (device-wide detection type) or an
/// object keyed by spec directory name.
#[derive(Clone, Debug, Default)]
pub struct DeviceMap {
    entries: HashMap<String, Value>,
}

impl DeviceMap {
    /// Missing table file is not an error: every record just classifies as
    /// "unknown". A present-but-broken file degrades the same way.
    pub fn load(path: &Path) -> DeviceMap {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(_) => {
                log::info!("Device map {} not found; detection_type will be \"{}\" for all records.", path.display(), UNKNOWN);
                return DeviceMap::default();
            }
        };
        match serde_json::from_slice::<HashMap<String, Value>>(&data) {
            Ok(entries) => DeviceMap { entries },
            Err(e) => {
                log::warn!("Device map {} is malformed ({}); falling back to \"{}\".", path.display(), e, UNKNOWN);
                DeviceMap::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    #[cfg(test)]
    pub fn from_json_str(json: &str) -> DeviceMap {
        DeviceMap { entries: serde_json::from_str(json).unwrap() }
    }

    pub fn classify(&self, device: &str, spec_dir_name: &str) -> String {
        match self.entries.get(device) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Object(m)) => match m.get(spec_dir_name) {
                Some(Value::String(s)) => s.clone(),
                _ => UNKNOWN.to_string(),
            },
            _ => UNKNOWN.to_string(),
        }
    }
}
