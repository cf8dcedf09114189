//! Raw payload normalization.
//!
//! openWB publishes a mix of wire formats: plain scalars, JSON blobs,
//! bracketed comma-separated lists, epoch timestamps and strings with
//! literal `\uXXXX` escapes. Every function in this module is total:
//! malformed input yields `None`, never a panic, so the catalog layer
//! can distinguish "never received" from "parsed to zero/false".

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

/// A normalized field value as stored in a device snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Lenient integer view, used e.g. for vehicle ids that arrive as
    /// either a JSON number or a quoted string.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u64),
            FieldValue::Text(t) => t.trim().trim_matches('"').parse().ok(),
            _ => None,
        }
    }
}

/// Whether a scale factor divides or multiplies the parsed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleOp {
    Divide,
    Multiply,
}

/// Normalizer id referenced by catalog rows.
///
/// Deliberately a tagged enum of named conversions rather than stored
/// closures: the catalog stays plain data and the conversion set is
/// testable on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalizer {
    /// Passthrough text with surrounding quotes stripped.
    Raw,
    /// Quote/period trim, 255-char cap, umlaut escape decoding.
    DisplayString,
    /// Plain float.
    Float,
    /// Float scaled by a factor and rounded to `digits` decimals.
    FloatScaled { factor: f64, op: ScaleOp, digits: i32 },
    /// Absolute float (PV power is reported negative).
    FloatAbs,
    /// "1"/"0", "true"/"false", "on"/"off".
    Bool,
    /// String value of one key in a JSON object payload.
    JsonText { key: &'static str },
    /// Float value of one key in a JSON object payload.
    JsonFloat { key: &'static str },
    /// String at a key path inside a nested JSON object.
    NestedText { path: &'static [&'static str] },
    /// Float at a key path inside a nested JSON object.
    NestedFloat { path: &'static [&'static str] },
    /// Nested float scaled by a factor (Wh→kWh, €/Wh→ct/kWh).
    NestedFloatScaled {
        path: &'static [&'static str],
        factor: f64,
        op: ScaleOp,
    },
    /// i-th element of a bracketed comma-separated float list.
    DelimitedFloat { index: usize },
    /// Epoch seconds as a scalar payload.
    EpochSeconds,
    /// Epoch seconds under one key of a JSON object payload.
    EpochFromJson { key: &'static str },
    /// Live-value JSON field scaled by `factor` and rounded to whole
    /// units (the controller reports kW, entities expose W).
    LiveValue { key: &'static str, factor: f64 },
}

impl Normalizer {
    /// Run the conversion against a raw string payload (the MQTT path).
    pub fn apply(&self, raw: &str) -> Option<FieldValue> {
        match self {
            Normalizer::Raw => Some(FieldValue::Text(strip_quotes(raw).to_string())),
            Normalizer::DisplayString => Some(FieldValue::Text(sanitize_display_string(raw))),
            Normalizer::Float => parse_float(raw, 1.0, ScaleOp::Divide).map(FieldValue::Float),
            Normalizer::FloatScaled { factor, op, digits } => {
                parse_float(raw, *factor, *op).map(|v| FieldValue::Float(round_to(v, *digits)))
            }
            Normalizer::FloatAbs => {
                parse_float(raw, 1.0, ScaleOp::Divide).map(|v| FieldValue::Float(v.abs()))
            }
            Normalizer::Bool => parse_bool(raw).map(FieldValue::Bool),
            Normalizer::JsonText { key } => {
                parse_json_field(raw, key).as_ref().and_then(value_to_text)
            }
            Normalizer::JsonFloat { key } => parse_json_field(raw, key)
                .as_ref()
                .and_then(value_to_f64)
                .map(FieldValue::Float),
            Normalizer::NestedText { path } => {
                parse_nested_field(raw, path).as_ref().and_then(value_to_text)
            }
            Normalizer::NestedFloat { path } => parse_nested_field(raw, path)
                .as_ref()
                .and_then(value_to_f64)
                .map(FieldValue::Float),
            Normalizer::NestedFloatScaled { path, factor, op } => {
                let v = parse_nested_field(raw, path).as_ref().and_then(value_to_f64)?;
                let scaled = match op {
                    ScaleOp::Divide => v / factor,
                    ScaleOp::Multiply => v * factor,
                };
                Some(FieldValue::Float(round_to(scaled, 3)))
            }
            Normalizer::DelimitedFloat { index } => {
                parse_delimited_float(raw, *index).map(FieldValue::Float)
            }
            Normalizer::EpochSeconds => parse_epoch_seconds(raw).map(FieldValue::Timestamp),
            Normalizer::EpochFromJson { key } => {
                parse_epoch_from_json_field(raw, key).map(FieldValue::Timestamp)
            }
            Normalizer::LiveValue { key, factor } => {
                let v = parse_json_field(raw, key).as_ref().and_then(value_to_f64)?;
                Some(FieldValue::Float((v * factor).round()))
            }
        }
    }

    /// Run the conversion against an already-parsed JSON value (the
    /// HTTP aggregate path). Scalars are rendered back to their string
    /// form so all conversions share one code path.
    pub fn apply_json(&self, value: &Value) -> Option<FieldValue> {
        match value {
            Value::Null => None,
            Value::String(s) => self.apply(s),
            other => self.apply(&other.to_string()),
        }
    }
}

/// Parse a float, optionally scaled. Absent on empty or non-numeric
/// input for every scale/op combination.
pub fn parse_float(raw: &str, scale: f64, op: ScaleOp) -> Option<f64> {
    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }
    let v: f64 = trimmed.parse().ok()?;
    Some(match op {
        ScaleOp::Divide => v / scale,
        ScaleOp::Multiply => v * scale,
    })
}

/// Parse a boolean from the payload forms openWB uses.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().trim_matches('"').to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Extract one key from a JSON object payload. Absent on malformed
/// JSON, a non-object root, or a missing key.
pub fn parse_json_field(raw: &str, key: &str) -> Option<Value> {
    let root: Value = serde_json::from_str(raw).ok()?;
    root.as_object()?.get(key).cloned()
}

/// Walk a JSON object through successive keys, stopping at the first
/// missing or non-object segment. An empty path returns the root.
pub fn parse_nested_field(raw: &str, path: &[&str]) -> Option<Value> {
    let mut current: Value = serde_json::from_str(raw).ok()?;
    for key in path {
        current = current.as_object()?.get(*key).cloned()?;
    }
    Some(current)
}

/// Extract the element at `index` from a bracketed comma-separated
/// float list, e.g. `[1.0,2.0,3.0]`.
pub fn parse_delimited_float(raw: &str, index: usize) -> Option<f64> {
    let stripped = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let element = stripped.split(',').nth(index)?;
    element.trim().parse().ok()
}

/// Epoch seconds (fractional accepted) to a UTC timestamp.
pub fn parse_epoch_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let secs = parse_float(raw, 1.0, ScaleOp::Divide)?;
    Utc.timestamp_opt(secs as i64, 0).single()
}

/// Epoch seconds found under `key` in a JSON object payload.
pub fn parse_epoch_from_json_field(raw: &str, key: &str) -> Option<DateTime<Utc>> {
    let value = parse_json_field(raw, key)?;
    let secs = value_to_f64(&value)?;
    Utc.timestamp_opt(secs as i64, 0).single()
}

/// Trim surrounding quotes/periods, cap at 255 characters and decode
/// the literal `\uXXXX` umlaut escapes openWB leaves in status strings.
pub fn sanitize_display_string(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim_matches('.');
    let mut s: String = trimmed.chars().take(255).collect();
    for (escape, replacement) in [
        ("\\u00fc", "ü"),
        ("\\u00dc", "Ü"),
        ("\\u00f6", "ö"),
        ("\\u00d6", "Ö"),
        ("\\u00e4", "ä"),
        ("\\u00c4", "Ä"),
    ] {
        if s.contains(escape) {
            s = s.replace(escape, replacement);
        }
    }
    s
}

fn strip_quotes(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

fn value_to_text(value: &Value) -> Option<FieldValue> {
    match value {
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Number(n) => Some(FieldValue::Text(n.to_string())),
        Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round_to(v: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (v * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_float_absent_on_garbage() {
        assert_eq!(parse_float("", 1.0, ScaleOp::Divide), None);
        assert_eq!(parse_float("abc", 1.0, ScaleOp::Divide), None);
        assert_eq!(parse_float("", 1000.0, ScaleOp::Multiply), None);
        assert_eq!(parse_float("abc", 42.0, ScaleOp::Multiply), None);
    }

    #[test]
    fn test_parse_float_scaling() {
        assert_eq!(parse_float("3000", 1000.0, ScaleOp::Divide), Some(3.0));
        assert_eq!(parse_float("3", 1000.0, ScaleOp::Multiply), Some(3000.0));
        assert_eq!(parse_float("\"2300\"", 1.0, ScaleOp::Divide), Some(2300.0));
    }

    #[test]
    fn test_parse_delimited_float() {
        assert_eq!(parse_delimited_float("[1.0,2.0,3.0]", 2), Some(3.0));
        assert_eq!(parse_delimited_float("1.0,2.0", 5), None);
        assert_eq!(parse_delimited_float("[1.0, x, 3.0]", 1), None);
        assert_eq!(parse_delimited_float("[10, 11, 12]", 1), Some(11.0));
    }

    #[test]
    fn test_parse_nested_field_empty_path_returns_root() {
        let root = parse_nested_field(r#"{"a": 1}"#, &[]).unwrap();
        assert_eq!(root, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_parse_nested_field_missing_segment() {
        let raw = r#"{"chargemode": {"instant_charging": {"current": 16}}}"#;
        assert_eq!(
            parse_nested_field(raw, &["chargemode", "instant_charging", "current"]),
            Some(serde_json::json!(16))
        );
        assert_eq!(parse_nested_field(raw, &["chargemode", "pv_charging", "current"]), None);
        assert_eq!(parse_nested_field("not json", &["a"]), None);
        assert_eq!(parse_nested_field("[1,2]", &["a"]), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_sanitize_display_string_umlauts() {
        assert_eq!(
            sanitize_display_string(r#""Ladung über SolarÜberschuss.""#),
            "Ladung über SolarÜberschuss"
        );
        assert_eq!(sanitize_display_string("\"ok\""), "ok");
    }

    #[test]
    fn test_sanitize_display_string_caps_length() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_display_string(&long).len(), 255);
    }

    #[test]
    fn test_epoch_seconds() {
        let ts = parse_epoch_seconds("1700000000").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(parse_epoch_seconds("null"), None);

        let from_json = parse_epoch_from_json_field(r#"{"timestamp": 1700000000}"#, "timestamp");
        assert_eq!(from_json.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(parse_epoch_from_json_field(r#"{"other": 1}"#, "timestamp"), None);
    }

    #[test]
    fn test_normalizer_live_value() {
        let n = Normalizer::LiveValue { key: "grid", factor: 1000.0 };
        assert_eq!(n.apply(r#"{"grid": 1.234}"#), Some(FieldValue::Float(1234.0)));
        assert_eq!(n.apply(r#"{"grid": "0.5"}"#), Some(FieldValue::Float(500.0)));
        assert_eq!(n.apply(r#"{"pv": 1.0}"#), None);
    }

    #[test]
    fn test_normalizer_apply_json_scalars() {
        let n = Normalizer::Float;
        assert_eq!(n.apply_json(&serde_json::json!("2300")), Some(FieldValue::Float(2300.0)));
        assert_eq!(n.apply_json(&serde_json::json!(2300)), Some(FieldValue::Float(2300.0)));
        assert_eq!(n.apply_json(&serde_json::Value::Null), None);

        let b = Normalizer::Bool;
        assert_eq!(b.apply_json(&serde_json::json!("1")), Some(FieldValue::Bool(true)));
    }

    #[test]
    fn test_normalizer_nested_scaled() {
        let n = Normalizer::NestedFloatScaled {
            path: &["chargemode", "instant_charging", "limit", "amount"],
            factor: 1000.0,
            op: ScaleOp::Divide,
        };
        let raw = r#"{"chargemode":{"instant_charging":{"limit":{"amount":10000}}}}"#;
        assert_eq!(n.apply(raw), Some(FieldValue::Float(10.0)));
    }

    #[test]
    fn test_field_value_as_u64() {
        assert_eq!(FieldValue::Float(3.0).as_u64(), Some(3));
        assert_eq!(FieldValue::Float(3.5).as_u64(), None);
        assert_eq!(FieldValue::Text("7".into()).as_u64(), Some(7));
        assert_eq!(FieldValue::Text("x".into()).as_u64(), None);
    }
}
