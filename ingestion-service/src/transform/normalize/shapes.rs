//! Recognisers for the message layouts controllers and collectors have
//! published over time. Each matcher either claims the document and returns
//! its points (possibly none) or declines with `None`.

use ledger_client::domain::{EnergyMode, TelemetryPoint, Unit};
use serde_json::{Map, Value};

use super::{parse_timestamp, MessageContext};
use crate::collector::{CONTROLLER_IP_FIELD, DEVICE_IP_FIELD};

pub type ShapeMatcher = fn(&Value, &MessageContext<'_>) -> Option<Vec<TelemetryPoint>>;

/// Tried in order; the first match wins.
pub const MATCHERS: &[(&str, ShapeMatcher)] = &[
    ("device_map", device_map),
    ("located_map", located_map),
    ("flat_point", flat_point),
    ("results_list", results_list),
    ("legacy_map", legacy_map),
];

const RESERVED_KEYS: [&str; 4] = ["data", "device_id", "param_key", "results"];
const LOCATION_FIELD: &str = "专有部分坐落";

pub fn extract(doc: &Value, ctx: &MessageContext<'_>) -> Option<(&'static str, Vec<TelemetryPoint>)> {
    MATCHERS
        .iter()
        .find_map(|(name, matcher)| matcher(doc, ctx).map(|points| (*name, points)))
}

fn address_of(fields: &Map<String, Value>) -> Option<String> {
    [CONTROLLER_IP_FIELD, DEVICE_IP_FIELD, "plc_ip", "ip"]
        .iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn str_field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Integral counter value; floats are rounded, numeric strings accepted.
fn counter_value(raw: Option<&Value>) -> Option<i64> {
    let as_float = match raw? {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Some(v);
            }
            n.as_f64()?
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    as_float.is_finite().then(|| as_float.round() as i64)
}

/// One metric reading of one unit. `default_success` applies when the
/// reading has no explicit `success` flag.
fn point(
    unit_key: &str,
    metric: &str,
    fields: &Map<String, Value>,
    address: Option<String>,
    default_success: bool,
    ctx: &MessageContext<'_>,
) -> Option<TelemetryPoint> {
    let unit_key = unit_key.trim();
    if unit_key.is_empty() {
        return None;
    }
    let Some(energy_mode) = EnergyMode::from_metric_key(metric) else {
        tracing::debug!(unit = unit_key, metric, "ignoring non-counter metric");
        return None;
    };

    let value = counter_value(fields.get("value").or_else(|| fields.get("param_value")));
    let flagged = fields
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(default_success);
    let captured_day = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or(ctx.fallback_day);

    Some(TelemetryPoint {
        unit: Unit::parse(unit_key),
        energy_mode,
        raw_counter_value: value.unwrap_or(0),
        source_address: address,
        captured_day,
        success: flagged && value.is_some(),
        message: fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn nested_points(
    unit_key: &str,
    device: &Map<String, Value>,
    data: &Map<String, Value>,
    ctx: &MessageContext<'_>,
) -> Vec<TelemetryPoint> {
    let address = address_of(device);
    data.iter()
        .filter_map(|(metric, reading)| point(unit_key, metric, reading.as_object()?, address.clone(), false, ctx))
        .collect()
}

/// `{ "<unit>": { "PLC IP地址": "…", "data": { "<metric>": {…} } }, … }`
fn device_map(doc: &Value, ctx: &MessageContext<'_>) -> Option<Vec<TelemetryPoint>> {
    let obj = doc.as_object()?;
    if obj.is_empty() || obj.keys().any(|k| RESERVED_KEYS.contains(&k.as_str())) {
        return None;
    }

    let devices = obj
        .iter()
        .map(|(key, device)| {
            let device = device.as_object()?;
            let data = device.get("data")?.as_object()?;
            Some((key, device, data))
        })
        .collect::<Option<Vec<_>>>()?;

    Some(
        devices
            .into_iter()
            .flat_map(|(key, device, data)| nested_points(key, device, data, ctx))
            .collect(),
    )
}

/// "成都乐府（二仙桥）-9-1-3104" → "9-1-3104"
fn unit_from_location(location: &str) -> Option<String> {
    let parts: Vec<&str> = location.split('-').map(str::trim).collect();
    (parts.len() >= 4).then(|| parts[1..=3].join("-"))
}

fn unit_from_topic(topic: &str) -> Option<String> {
    topic
        .split('/')
        .nth(4)
        .filter(|segment| segment.contains('-'))
        .map(str::to_string)
}

/// Flat object with Chinese-labelled location fields and a top-level `data`.
fn located_map(doc: &Value, ctx: &MessageContext<'_>) -> Option<Vec<TelemetryPoint>> {
    let obj = doc.as_object()?;
    let data = obj.get("data")?.as_object()?;

    let unit_key = obj
        .get(LOCATION_FIELD)
        .and_then(Value::as_str)
        .and_then(unit_from_location)
        .or_else(|| unit_from_topic(ctx.topic));
    let Some(unit_key) = unit_key else {
        tracing::warn!(topic = ctx.topic, "located message has no resolvable unit");
        return Some(Vec::new());
    };

    let address = address_of(obj);
    Some(
        data.iter()
            .filter_map(|(metric, reading)| point(&unit_key, metric, reading.as_object()?, address.clone(), false, ctx))
            .collect(),
    )
}

fn point_from_flat(obj: &Map<String, Value>, ctx: &MessageContext<'_>) -> Option<TelemetryPoint> {
    let unit_key = str_field(obj, &["device_id", "specific_part"])?;
    let metric = str_field(obj, &["param_key", "energy_mode"])?;
    point(unit_key, metric, obj, address_of(obj), true, ctx)
}

/// `{ "device_id": "…", "param_key": "…", "value": … }`
fn flat_point(doc: &Value, ctx: &MessageContext<'_>) -> Option<Vec<TelemetryPoint>> {
    let obj = doc.as_object()?;
    let has_unit = obj.contains_key("device_id") || obj.contains_key("specific_part");
    let has_metric = obj.contains_key("param_key") || obj.contains_key("energy_mode");
    if !(has_unit && has_metric) {
        return None;
    }
    Some(point_from_flat(obj, ctx).into_iter().collect())
}

/// `{ "results": [flat point, …] }` or a bare top-level array.
fn results_list(doc: &Value, ctx: &MessageContext<'_>) -> Option<Vec<TelemetryPoint>> {
    let items = match doc {
        Value::Array(items) => items,
        Value::Object(obj) => obj.get("results")?.as_array()?,
        _ => return None,
    };

    Some(
        items
            .iter()
            .filter_map(|item| match item.as_object() {
                Some(obj) => point_from_flat(obj, ctx),
                None => {
                    tracing::warn!(topic = ctx.topic, "skipping non-object result item");
                    None
                }
            })
            .collect(),
    )
}

/// `{ "<unit>": { "<metric>": <value>, … } }`, with per-device fallback to
/// the nested `data` layout.
fn legacy_map(doc: &Value, ctx: &MessageContext<'_>) -> Option<Vec<TelemetryPoint>> {
    let obj = doc.as_object()?;
    if obj.is_empty() || !obj.values().all(Value::is_object) {
        return None;
    }

    let mut points = Vec::new();
    for (unit_key, device) in obj {
        let Some(device) = device.as_object() else {
            continue;
        };
        if let Some(data) = device.get("data").and_then(Value::as_object) {
            points.extend(nested_points(unit_key, device, data, ctx));
            continue;
        }

        for (metric, reading) in device {
            let parsed = match reading {
                Value::Object(fields) => point(unit_key, metric, fields, None, false, ctx),
                scalar => {
                    let mut fields = Map::new();
                    fields.insert("value".to_string(), scalar.clone());
                    point(unit_key, metric, &fields, None, true, ctx)
                }
            };
            points.extend(parsed);
        }
    }
    Some(points)
}
