use crate::device_map::DeviceMap;
use serde_json::Value;

/// One classified detection event. Never mutated after parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub device: String,
    pub timestamp: String,
    pub spec_dir_name: String,
    pub status: String,
    pub detection_type: String,
}

const FIELD_DELIM: char = '~';

/// True when the line has the minimum field count and its timestamp falls on
/// the target date. This is the quantity the per-file summary counts; a
/// matching line may still expand into zero records.
pub fn is_target_date_line(line: &str, target_date_prefix: &str) -> bool {
    let parts: Vec<&str> = line.trim().split(FIELD_DELIM).collect();
    parts.len() >= 3 && parts[1].starts_with(target_date_prefix)
}

/// Parses one raw log line into zero or more records.
///
/// Line layout: `device~timestamp~...~<json object>~<trailer>`. The JSON
/// object sits in the second-to-last field; each of its keys is one detection
/// event carrying `SpecDirName` and `status`. Lines for other dates, short
/// lines and lines with malformed JSON all yield zero records.
pub fn parse_line(line: &str, target_date_prefix: &str, map: &DeviceMap) -> Vec<LogRecord> {
    let parts: Vec<&str> = line.trim().split(FIELD_DELIM).collect();
    if parts.len() < 3 { return vec![]; }
    let device = parts[0];
    let ts = parts[1];
    if !ts.starts_with(target_date_prefix) { return vec![]; }
    let payload = parts[parts.len() - 2];
    let data: Value = serde_json::from_str(payload).unwrap_or(Value::Object(Default::default()));
    let obj = match data.as_object() { Some(o) => o, None => return vec![] };
    let mut out = Vec::with_capacity(obj.len());
    for (_key, event) in obj {
        let spec_dir_name = event.get("SpecDirName").and_then(Value::as_str).unwrap_or("");
        let status = event.get("status").and_then(Value::as_str).unwrap_or("");
        out.push(LogRecord {
            device: device.to_string(),
            timestamp: ts.to_string(),
            spec_dir_name: spec_dir_name.to_string(),
            status: status.to_string(),
            detection_type: map.classify(device, spec_dir_name),
        });
    }
    out
}
