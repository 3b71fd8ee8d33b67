use crate::grouping::group_by_session;
use crate::keywords::{classify_phase, is_error_event, is_timeout_name, Phase};
use cgmtrace_ingest_core::EventRecord;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scanning,
    Pairing,
    Connecting,
    Connected,
    Communicating,
    Disconnected,
    Timeout,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Pairing => "pairing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Communicating => "communicating",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseMark {
    pub phase: Phase,
    pub timestamp_ms: i64,
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_key: String,
    pub device_id: Option<String>,
    pub status: SessionStatus,
    pub first_event_ms: Option<i64>,
    pub last_event_ms: Option<i64>,
    pub duration_ms: i64,
    pub scan_start_ms: Option<i64>,
    pub pair_start_ms: Option<i64>,
    pub connect_start_ms: Option<i64>,
    pub connected_ms: Option<i64>,
    pub disconnect_ms: Option<i64>,
    pub connection_time_ms: Option<i64>,
    pub timeline: Vec<PhaseMark>,
    pub event_count: usize,
    pub error_count: usize,
    pub command_count: usize,
}

/// Folds one session's ordered events into its lifecycle projection.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    session_key: String,
    device_id: Option<String>,
    status: SessionStatus,
    first_event_ms: Option<i64>,
    last_event_ms: Option<i64>,
    scan_start_ms: Option<i64>,
    pair_start_ms: Option<i64>,
    connect_start_ms: Option<i64>,
    connected_ms: Option<i64>,
    disconnect_ms: Option<i64>,
    timeline: Vec<PhaseMark>,
    request_keys: HashSet<String>,
    event_count: usize,
    error_count: usize,
}

impl SessionTracker {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            device_id: None,
            status: SessionStatus::Scanning,
            first_event_ms: None,
            last_event_ms: None,
            scan_start_ms: None,
            pair_start_ms: None,
            connect_start_ms: None,
            connected_ms: None,
            disconnect_ms: None,
            timeline: Vec::new(),
            request_keys: HashSet::new(),
            event_count: 0,
            error_count: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn apply(&mut self, event: &EventRecord) {
        let ts = event.timestamp_ms;
        self.event_count += 1;
        self.first_event_ms.get_or_insert(ts);
        self.last_event_ms = Some(ts);
        if self.device_id.is_none() {
            self.device_id = event.device_id.clone();
        }
        if let Some(request) = &event.request_key {
            if !self.request_keys.contains(request) {
                self.request_keys.insert(request.clone());
            }
        }

        if let Some(phase) = classify_phase(&event.event_name) {
            self.enter_phase(phase, ts, &event.event_name);
        }

        if is_error_event(event) {
            self.error_count += 1;
            // An explicit disconnect outranks any error that follows it.
            if self.status != SessionStatus::Disconnected {
                self.status = if is_timeout_name(&event.event_name) {
                    SessionStatus::Timeout
                } else {
                    SessionStatus::Error
                };
            }
        }
    }

    fn enter_phase(&mut self, phase: Phase, ts: i64, event_name: &str) {
        let (slot, status, every_match) = match phase {
            Phase::Scan => (&mut self.scan_start_ms, SessionStatus::Scanning, false),
            Phase::Pair => (&mut self.pair_start_ms, SessionStatus::Pairing, false),
            Phase::Connect => (&mut self.connect_start_ms, SessionStatus::Connecting, false),
            Phase::Connected => (&mut self.connected_ms, SessionStatus::Connected, true),
            Phase::Disconnect => (&mut self.disconnect_ms, SessionStatus::Disconnected, true),
        };
        if slot.is_some() && !every_match {
            return;
        }
        *slot = Some(ts);
        self.status = status;
        self.timeline.push(PhaseMark {
            phase,
            timestamp_ms: ts,
            event_name: event_name.to_string(),
        });
    }

    pub fn finish(self) -> SessionReport {
        let status = if self.connected_ms.is_some() && !self.request_keys.is_empty() {
            SessionStatus::Communicating
        } else {
            self.status
        };
        let duration_ms = match (self.first_event_ms, self.last_event_ms) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };
        let connection_time_ms = match (self.scan_start_ms, self.connected_ms) {
            (Some(scan), Some(connected)) => Some(connected - scan),
            _ => None,
        };

        SessionReport {
            session_key: self.session_key,
            device_id: self.device_id,
            status,
            first_event_ms: self.first_event_ms,
            last_event_ms: self.last_event_ms,
            duration_ms,
            scan_start_ms: self.scan_start_ms,
            pair_start_ms: self.pair_start_ms,
            connect_start_ms: self.connect_start_ms,
            connected_ms: self.connected_ms,
            disconnect_ms: self.disconnect_ms,
            connection_time_ms,
            timeline: self.timeline,
            event_count: self.event_count,
            error_count: self.error_count,
            command_count: self.request_keys.len(),
        }
    }
}

pub fn reconstruct_session<'a>(
    session_key: &str,
    events: impl IntoIterator<Item = &'a EventRecord>,
) -> SessionReport {
    let mut tracker = SessionTracker::new(session_key);
    for event in events {
        tracker.apply(event);
    }
    tracker.finish()
}

/// One report per session key, in first-seen order.
pub fn reconstruct_sessions(events: &[EventRecord]) -> Vec<SessionReport> {
    group_by_session(events)
        .iter()
        .map(|(key, group)| reconstruct_session(key, group.iter().copied()))
        .collect()
}
