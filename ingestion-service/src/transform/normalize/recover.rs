//! Field-level extraction for payloads that are not valid JSON.
//!
//! Both tiers rebuild a canonical device-map document so the result goes
//! through the same shape matchers as a clean payload.

use ledger_client::domain::EnergyMode;
use regex::Regex;
use serde_json::{Map, Value};

use crate::collector::CONTROLLER_IP_FIELD;
use crate::pipeline::DecodeTier;

struct MetricPatterns {
    key: &'static str,
    value: Regex,
    success: Regex,
    message: Regex,
}

impl MetricPatterns {
    fn compile(key: &'static str) -> Result<Self, regex::Error> {
        let field = |name: &str, capture: &str| {
            Regex::new(&format!(
                r#""{}"\s*:\s*\{{[^}}]*"{name}"\s*:\s*{capture}"#,
                regex::escape(key)
            ))
        };
        Ok(Self {
            key,
            value: field("value", r"([^,}]*)")?,
            success: field("success", r"([^,}]*)")?,
            message: field("message", r#""([^"]*)""#)?,
        })
    }
}

pub struct RecoveryPatterns {
    device_id: Regex,
    address: Regex,
    timestamp: Regex,
    metrics: Vec<MetricPatterns>,
}

fn capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)?.get(1).map(|m| m.as_str().trim())
}

fn scalar(raw: &str) -> Value {
    let raw = raw.trim_matches('"').trim();
    if raw == "null" {
        return Value::Null;
    }
    raw.parse::<i64>()
        .map(Value::from)
        .ok()
        .or_else(|| raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number))
        .unwrap_or(Value::Null)
}

impl RecoveryPatterns {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            device_id: Regex::new(r#""([0-9\-]+)"\s*:\s*\{"#)?,
            address: Regex::new(&format!(r#""{CONTROLLER_IP_FIELD}"\s*:\s*"([^"]*)""#))?,
            timestamp: Regex::new(r#""timestamp"\s*:\s*"([^"]*)""#)?,
            metrics: EnergyMode::ALL
                .iter()
                .map(|mode| MetricPatterns::compile(mode.metric_key()))
                .collect::<Result<_, _>>()?,
        })
    }

    /// `None` when not even a device id can be found.
    pub fn recover(&self, text: &str) -> Option<(DecodeTier, Value)> {
        let device_id = capture(&self.device_id, text)?;
        Some(match self.fields(device_id, text) {
            Some(doc) => (DecodeTier::Recovered, doc),
            None => (DecodeTier::Minimal, self.minimal(device_id)),
        })
    }

    fn fields(&self, device_id: &str, text: &str) -> Option<Value> {
        let timestamp = capture(&self.timestamp, text);

        let mut data = Map::new();
        for metric in &self.metrics {
            let Some(raw_value) = capture(&metric.value, text) else {
                continue;
            };
            let mut reading = Map::new();
            reading.insert("value".into(), scalar(raw_value));
            reading.insert(
                "success".into(),
                Value::Bool(capture(&metric.success, text) == Some("true")),
            );
            reading.insert(
                "message".into(),
                capture(&metric.message, text).unwrap_or_default().into(),
            );
            if let Some(ts) = timestamp {
                reading.insert("timestamp".into(), ts.into());
            }
            data.insert(metric.key.to_string(), Value::Object(reading));
        }
        if data.is_empty() {
            return None;
        }

        let mut device = Map::new();
        if let Some(ip) = capture(&self.address, text).filter(|ip| !ip.is_empty()) {
            device.insert(CONTROLLER_IP_FIELD.into(), ip.into());
        }
        device.insert("data".into(), Value::Object(data));
        Some(wrap(device_id, device))
    }

    /// Device id only: every counter reported as a failed zero reading.
    fn minimal(&self, device_id: &str) -> Value {
        let data = self
            .metrics
            .iter()
            .map(|metric| {
                let reading = serde_json::json!({
                    "value": 0,
                    "success": false,
                    "message": "payload unrecoverable",
                });
                (metric.key.to_string(), reading)
            })
            .collect::<Map<_, _>>();

        let mut device = Map::new();
        device.insert("data".into(), Value::Object(data));
        wrap(device_id, device)
    }
}

fn wrap(device_id: &str, device: Map<String, Value>) -> Value {
    let mut doc = Map::new();
    doc.insert(device_id.to_string(), Value::Object(device));
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_fields_out_of_truncated_json() {
        let patterns = RecoveryPatterns::compile().unwrap();
        let text = r#"{"9-1-3104": {"PLC IP地址": "10.0.0.7", "data": {"total_cold_quantity": {"value": 500, "success": true, "message": "ok", "timestamp": "2025-01-10 08:00:00"}, "total_hot_quantity": {"value": null, "success": false"#;

        let (tier, doc) = patterns.recover(text).unwrap();
        assert_eq!(tier, DecodeTier::Recovered);

        let device = &doc["9-1-3104"];
        assert_eq!(device["PLC IP地址"], "10.0.0.7");
        assert_eq!(device["data"]["total_cold_quantity"]["value"], 500);
        assert_eq!(device["data"]["total_cold_quantity"]["success"], true);
        assert_eq!(device["data"]["total_cold_quantity"]["timestamp"], "2025-01-10 08:00:00");
        assert!(device["data"]["total_hot_quantity"]["value"].is_null());
        assert_eq!(device["data"]["total_hot_quantity"]["success"], false);
    }

    #[test]
    fn device_id_alone_yields_minimal_document() {
        let patterns = RecoveryPatterns::compile().unwrap();
        let (tier, doc) = patterns.recover(r#"{"9-1-3104": {"garbage"#).unwrap();
        assert_eq!(tier, DecodeTier::Minimal);
        assert_eq!(doc["9-1-3104"]["data"]["total_hot_quantity"]["success"], false);
        assert_eq!(doc["9-1-3104"]["data"]["total_cold_quantity"]["value"], 0);
    }

    #[test]
    fn nothing_recoverable_without_device_id() {
        let patterns = RecoveryPatterns::compile().unwrap();
        assert!(patterns.recover("not json at all").is_none());
    }
}
