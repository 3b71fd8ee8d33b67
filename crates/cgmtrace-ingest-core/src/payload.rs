//! Coercion of untyped producer payloads into typed fields.

use crate::model::Payload;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

pub const SESSION_KEY_FIELDS: &[&str] = &["linkCode", "link_code", "sessionKey", "sessionId"];
pub const REQUEST_KEY_FIELDS: &[&str] = &["requestKey", "requestId", "request_id", "reqId", "cmdId"];
pub const ATTEMPT_KEY_FIELDS: &[&str] = &["attemptKey", "attemptId", "attempt_id", "retryId"];
pub const DEVICE_ID_FIELDS: &[&str] = &[
    "deviceId",
    "mac",
    "macAddress",
    "sn",
    "serial",
    "serialNumber",
];
pub const ERROR_CODE_FIELDS: &[&str] = &["errorCode", "error_code", "errCode", "gattStatus"];
/// Generic names that only count as an error code on error-level records.
pub const LOOSE_ERROR_CODE_FIELDS: &[&str] = &["code", "status"];

const NESTED_KEYS: &[&str] = &["data", "extra"];

fn token_re() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*[:=]\s*"?([^\s,;"'{}\[\]]+)"#)
            .expect("valid payload token regex")
    })
}

/// Renders a scalar JSON value as a trimmed, non-empty string.
pub fn coerce_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 && f.abs() < 1e15 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Lifts an arbitrary JSON value into a [`Payload`]. Strings holding a JSON
/// object are unwrapped.
pub fn payload_from_value(value: Option<&Value>) -> Payload {
    match value {
        None | Some(Value::Null) => Payload::Absent,
        Some(Value::Object(map)) => Payload::Object(map.clone()),
        Some(Value::Number(n)) => n.as_f64().map(Payload::Number).unwrap_or(Payload::Absent),
        Some(Value::Bool(b)) => Payload::Text(b.to_string()),
        Some(Value::Array(_)) => Payload::Text(value.map(Value::to_string).unwrap_or_default()),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Payload::Absent;
            }
            if trimmed.starts_with('{') {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
                    return Payload::Object(map);
                }
            }
            Payload::Text(s.clone())
        }
    }
}

fn lookup_in_map(map: &Map<String, Value>, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|key| map.get(*key).and_then(coerce_scalar))
}

fn lookup_nested(map: &Map<String, Value>, candidates: &[&str]) -> Option<String> {
    NESTED_KEYS.iter().find_map(|nested| match map.get(*nested) {
        Some(Value::Object(inner)) => lookup_in_map(inner, candidates),
        _ => None,
    })
}

/// `key:value` and `key=value` tokens in free text, in order of appearance.
pub fn text_tokens(text: &str) -> Vec<(String, String)> {
    token_re()
        .captures_iter(text)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

fn lookup_in_text(text: &str, candidates: &[&str]) -> Option<String> {
    let tokens = text_tokens(text);
    candidates.iter().find_map(|candidate| {
        tokens
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(candidate))
            .map(|(_, value)| value.clone())
    })
}

/// Field lookup across an inner envelope and its payload.
///
/// Sources are consulted in a fixed order: the inner object's own fields, the
/// payload object, nested `data`/`extra` objects, then `key=value` tokens in
/// free-text messages. Within a source the candidate list order decides.
pub struct FieldSources<'a> {
    pub inner: &'a Map<String, Value>,
    pub payload: &'a Payload,
}

impl<'a> FieldSources<'a> {
    pub fn new(inner: &'a Map<String, Value>, payload: &'a Payload) -> Self {
        Self { inner, payload }
    }

    pub fn lookup(&self, candidates: &[&str]) -> Option<String> {
        if let Some(found) = lookup_in_map(self.inner, candidates) {
            return Some(found);
        }

        if let Some(object) = self.payload.as_object() {
            if let Some(found) = lookup_in_map(object, candidates) {
                return Some(found);
            }
        }

        if let Some(found) = lookup_nested(self.inner, candidates) {
            return Some(found);
        }

        if let Some(found) = self
            .payload
            .as_object()
            .and_then(|object| lookup_nested(object, candidates))
        {
            return Some(found);
        }

        self.payload
            .as_text()
            .and_then(|text| lookup_in_text(text, candidates))
    }
}
