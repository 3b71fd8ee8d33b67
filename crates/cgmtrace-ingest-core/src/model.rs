use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PARSER_ERROR_EVENT: &str = "PARSER_ERROR";

pub const LEVEL_DEBUG: u8 = 1;
pub const LEVEL_INFO: u8 = 2;
pub const LEVEL_WARN: u8 = 3;
pub const LEVEL_ERROR: u8 = 4;

/// Producer-specific detail attached to an event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Absent,
    Text(String),
    Number(f64),
    Object(Map<String, Value>),
}

impl Payload {
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub name: Option<String>,
    pub id: Option<i64>,
    pub is_main: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub sdk_version: Option<String>,
    pub terminal_id: Option<String>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub record_id: u64,
    pub timestamp_ms: i64,
    pub level: u8,
    pub event_name: String,
    pub session_key: Option<String>,
    pub request_key: Option<String>,
    pub attempt_key: Option<String>,
    pub device_id: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub thread: ThreadInfo,
    #[serde(default)]
    pub source: SourceInfo,
    #[serde(default)]
    pub payload: Payload,
}

impl EventRecord {
    pub fn new(record_id: u64, timestamp_ms: i64, level: u8, event_name: impl Into<String>) -> Self {
        Self {
            record_id,
            timestamp_ms,
            level: clamp_level(i64::from(level)),
            event_name: event_name.into(),
            session_key: None,
            request_key: None,
            attempt_key: None,
            device_id: None,
            error_code: None,
            message: None,
            thread: ThreadInfo::default(),
            source: SourceInfo::default(),
            payload: Payload::Absent,
        }
    }

    pub fn parser_error(record_id: u64, now_ms: i64, raw_line: &str, error: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("raw_line".to_string(), Value::String(raw_line.to_string()));
        payload.insert("error".to_string(), Value::String(error.to_string()));

        let mut record = Self::new(record_id, now_ms, LEVEL_ERROR, PARSER_ERROR_EVENT);
        record.message = Some(error.to_string());
        record.payload = Payload::Object(payload);
        record
    }

    pub fn with_session(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_request(mut self, key: impl Into<String>) -> Self {
        self.request_key = Some(key.into());
        self
    }

    pub fn with_attempt(mut self, key: impl Into<String>) -> Self {
        self.attempt_key = Some(key.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn is_error_level(&self) -> bool {
        self.level >= LEVEL_ERROR
    }

    pub fn is_parser_error(&self) -> bool {
        self.event_name == PARSER_ERROR_EVENT
    }

    /// Case-insensitive substring test against the event name.
    pub fn name_contains(&self, needle: &str) -> bool {
        contains_ignore_ascii_case(&self.event_name, needle)
    }

    /// Ordering key guaranteed by the storage layer.
    pub fn order_key(&self) -> (i64, u64) {
        (self.timestamp_ms, self.record_id)
    }
}

pub fn clamp_level(raw: i64) -> u8 {
    raw.clamp(i64::from(LEVEL_DEBUG), i64::from(LEVEL_ERROR)) as u8
}

pub fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Parsed,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsed => "parsed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub status: FileStatus,
    pub records: u64,
    pub parser_errors: u64,
    pub reason: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodeStats {
    pub blocks_attempted: u64,
    pub blocks_succeeded: u64,
    pub blocks_failed: u64,
}

impl DecodeStats {
    pub fn is_degraded(&self) -> bool {
        self.blocks_failed > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub records: Vec<EventRecord>,
    pub parser_errors: u64,
    pub error_samples: Vec<String>,
}

impl ParsedBatch {
    pub fn status(&self) -> FileStatus {
        if self.parser_errors == 0 {
            FileStatus::Parsed
        } else {
            FileStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub file_id: String,
    pub fingerprint: String,
    pub container: bool,
    pub decode: DecodeStats,
    pub lines: u64,
    pub records: u64,
    pub parser_errors: u64,
    pub error_samples: Vec<String>,
    pub status: FileStatus,
}
