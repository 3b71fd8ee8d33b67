use crate::model::{clamp_level, EventRecord, ParsedBatch, SourceInfo, ThreadInfo, LEVEL_ERROR};
use crate::payload::{
    coerce_bool, coerce_i64, coerce_scalar, payload_from_value, FieldSources, ATTEMPT_KEY_FIELDS,
    DEVICE_ID_FIELDS, ERROR_CODE_FIELDS, LOOSE_ERROR_CODE_FIELDS, REQUEST_KEY_FIELDS,
    SESSION_KEY_FIELDS,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

const RAW_FRAGMENT_LIMIT: usize = 20_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("expected JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("line is {actual} bytes; limit is {limit}")]
    LineTooLong { actual: usize, limit: usize },
}

fn required<'a>(map: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, EnvelopeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(EnvelopeError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn required_i64(map: &Map<String, Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = required(map, field)?;
    coerce_i64(value).ok_or_else(|| EnvelopeError::InvalidField {
        field,
        reason: format!("expected integer, got {value}"),
    })
}

fn inner_object(outer: &Map<String, Value>) -> Result<Map<String, Value>, EnvelopeError> {
    match required(outer, "payload")? {
        Value::Object(map) => Ok(map.clone()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(EnvelopeError::InvalidField {
                field: "payload",
                reason: "inner payload is not a JSON object".to_string(),
            }),
            Err(exc) => Err(EnvelopeError::InvalidField {
                field: "payload",
                reason: format!("inner payload is not valid JSON: {exc}"),
            }),
        },
        other => Err(EnvelopeError::InvalidField {
            field: "payload",
            reason: format!("expected string or object, got {other}"),
        }),
    }
}

fn optional_string(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(coerce_scalar)
}

fn message_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Parses one envelope line into an event.
pub fn parse_line(line: &str, record_id: u64) -> Result<EventRecord, EnvelopeError> {
    let outer = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(EnvelopeError::NotAnObject),
        Err(exc) => return Err(EnvelopeError::InvalidJson(exc.to_string())),
    };

    let inner = inner_object(&outer)?;
    let level = required_i64(&outer, "level")?;
    let timestamp_ms = required_i64(&outer, "timestampMs")?;

    let event_name = match required(&inner, "eventName")? {
        Value::String(name) if !name.trim().is_empty() => name.trim().to_string(),
        other => {
            return Err(EnvelopeError::InvalidField {
                field: "eventName",
                reason: format!("expected non-empty string, got {other}"),
            })
        }
    };

    let payload = payload_from_value(inner.get("message"));
    let level = clamp_level(level);

    let sources = FieldSources::new(&inner, &payload);
    let mut error_code = sources.lookup(ERROR_CODE_FIELDS);
    if error_code.is_none() && level >= LEVEL_ERROR {
        error_code = sources.lookup(LOOSE_ERROR_CODE_FIELDS);
    }

    let mut record = EventRecord::new(record_id, timestamp_ms, level, event_name);
    record.session_key = sources.lookup(SESSION_KEY_FIELDS);
    record.request_key = sources.lookup(REQUEST_KEY_FIELDS);
    record.attempt_key = sources.lookup(ATTEMPT_KEY_FIELDS);
    record.device_id = sources.lookup(DEVICE_ID_FIELDS);
    record.error_code = error_code;
    record.message = message_text(inner.get("message"));
    record.thread = ThreadInfo {
        name: optional_string(&outer, "threadName"),
        id: outer.get("threadId").and_then(coerce_i64),
        is_main: outer.get("isMainThread").and_then(coerce_bool),
    };
    record.source = SourceInfo {
        sdk_version: optional_string(&inner, "sdkVersion"),
        terminal_id: optional_string(&inner, "terminalId"),
        app_id: optional_string(&inner, "appId"),
    };
    record.payload = payload;

    Ok(record)
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}

/// Line-at-a-time envelope parser that never drops a line.
#[derive(Debug, Clone)]
pub struct EnvelopeParser {
    max_line_bytes: usize,
    sample_limit: usize,
}

impl Default for EnvelopeParser {
    fn default() -> Self {
        Self {
            max_line_bytes: 1_048_576,
            sample_limit: 20,
        }
    }
}

impl EnvelopeParser {
    pub fn new(max_line_bytes: usize, sample_limit: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
            sample_limit,
        }
    }

    pub fn from_config(cfg: &cgmtrace_config::IngestConfig) -> Self {
        Self::new(cfg.max_line_bytes, cfg.sample_error_lines)
    }

    fn parse_one(&self, line: &str, record_id: u64) -> Result<EventRecord, EnvelopeError> {
        if line.len() > self.max_line_bytes {
            return Err(EnvelopeError::LineTooLong {
                actual: line.len(),
                limit: self.max_line_bytes,
            });
        }
        parse_line(line, record_id)
    }

    /// Blank lines are skipped; each other line yields exactly one record,
    /// a `PARSER_ERROR` record when the line is malformed.
    pub fn parse_lines_at<I, S>(&self, lines: I, now_ms: i64) -> ParsedBatch
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = ParsedBatch::default();
        let mut record_id = 0u64;

        for line in lines {
            let line = line.as_ref().trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            record_id += 1;

            match self.parse_one(line, record_id) {
                Ok(record) => batch.records.push(record),
                Err(exc) => {
                    let error_text = exc.to_string();
                    debug!("line {record_id} failed envelope parse: {error_text}");
                    batch.parser_errors += 1;
                    if batch.error_samples.len() < self.sample_limit {
                        batch
                            .error_samples
                            .push(format!("line {record_id}: {error_text}"));
                    }
                    let raw = truncate(line, RAW_FRAGMENT_LIMIT);
                    batch
                        .records
                        .push(EventRecord::parser_error(record_id, now_ms, &raw, &error_text));
                }
            }
        }

        batch
    }

    pub fn parse_lines<I, S>(&self, lines: I) -> ParsedBatch
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parse_lines_at(lines, chrono::Utc::now().timestamp_millis())
    }
}
