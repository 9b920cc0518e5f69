//! Per-kind wire codecs for scalar leaves. `encode` turns a stored
//! attribute value into its wire shape; `decode` coerces a submitted
//! wire value back into the stored shape. Relation, collection and
//! attachment kinds need provider access and live in the Reader/Writer.

use crate::error::BindError;
use crate::spec::resolved::FieldKind;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

pub trait FieldCodec {
    fn encode(&self, stored: Option<&Value>) -> Value;
    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError>;
}

struct BooleanCodec;

impl FieldCodec for BooleanCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        json!(stored.and_then(Value::as_bool).unwrap_or(false))
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        Ok(json!(wire.and_then(Value::as_bool).unwrap_or(false)))
    }
}

struct TextCodec;

impl FieldCodec for TextCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        json!(stored.and_then(Value::as_str).unwrap_or(""))
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        match wire {
            None | Some(Value::Null) => Ok(json!("")),
            Some(Value::String(s)) => Ok(json!(s)),
            Some(other) => Err(BindError::Validation(format!(
                "expected text, got {other}"
            ))),
        }
    }
}

/// Stored as a JSON array of lines; newline-joined on the wire.
struct TextArrayCodec;

impl FieldCodec for TextArrayCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        let lines: Vec<&str> = stored
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        json!(lines.join("\n"))
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        let text = wire.and_then(Value::as_str).unwrap_or("");
        let lines: Vec<Value> = text.split('\n').map(|l| json!(l)).collect();
        Ok(Value::Array(lines))
    }
}

struct NumberCodec;

impl FieldCodec for NumberCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        stored.cloned().unwrap_or(Value::Null)
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        match wire {
            None | Some(Value::Null) => Ok(Value::Null),
            Some(Value::Number(n)) => Ok(json!(n)),
            Some(Value::String(s)) => {
                let n: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| BindError::Validation(format!("'{s}' is not a number")))?;
                Ok(json!(n))
            }
            Some(other) => Err(BindError::Validation(format!(
                "expected number, got {other}"
            ))),
        }
    }
}

/// Decimals travel and are stored as strings, never binary floats.
struct DecimalCodec;

impl FieldCodec for DecimalCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        json!(stored.and_then(Value::as_str).unwrap_or("0"))
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        let raw = match wire {
            None | Some(Value::Null) => "0".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(BindError::Validation(format!(
                    "expected decimal, got {other}"
                )))
            }
        };
        let d = Decimal::from_str(raw.trim())
            .map_err(|_| BindError::Validation(format!("'{raw}' is not a decimal")))?;
        Ok(json!(d.to_string()))
    }
}

/// ISO date (`%Y-%m-%d`) or null. Longer timestamps are truncated to the
/// date part before validation.
struct DateCodec;

impl FieldCodec for DateCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        stored.cloned().unwrap_or(Value::Null)
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        match wire {
            None | Some(Value::Null) => Ok(Value::Null),
            Some(Value::String(s)) if s.is_empty() => Ok(Value::Null),
            Some(Value::String(s)) => {
                let head: String = s.chars().take(10).collect();
                let d = NaiveDate::parse_from_str(&head, "%Y-%m-%d")
                    .map_err(|_| BindError::Validation(format!("'{s}' is not a date")))?;
                Ok(json!(d.format("%Y-%m-%d").to_string()))
            }
            Some(other) => Err(BindError::Validation(format!("expected date, got {other}"))),
        }
    }
}

/// Pass-through for hidden values (ids).
struct HiddenCodec;

impl FieldCodec for HiddenCodec {
    fn encode(&self, stored: Option<&Value>) -> Value {
        stored.cloned().unwrap_or(Value::Null)
    }

    fn decode(&self, wire: Option<&Value>) -> Result<Value, BindError> {
        Ok(wire.cloned().unwrap_or(Value::Null))
    }
}

/// Look up the codec for a scalar kind. Returns `None` for kinds whose
/// read/write needs provider context.
pub fn codec_for(kind: FieldKind) -> Option<&'static dyn FieldCodec> {
    match kind {
        FieldKind::Boolean => Some(&BooleanCodec),
        FieldKind::Text | FieldKind::Textarea => Some(&TextCodec),
        FieldKind::TextArray => Some(&TextArrayCodec),
        FieldKind::Number => Some(&NumberCodec),
        FieldKind::Decimal => Some(&DecimalCodec),
        FieldKind::Date | FieldKind::Month => Some(&DateCodec),
        FieldKind::Hidden => Some(&HiddenCodec),
        _ => None,
    }
}
