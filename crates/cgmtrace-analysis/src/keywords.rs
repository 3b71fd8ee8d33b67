use cgmtrace_ingest_core::model::contains_ignore_ascii_case;
use cgmtrace_ingest_core::EventRecord;
use serde::Serialize;

/// Connection lifecycle phase inferred from an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scan,
    Pair,
    Connect,
    Connected,
    Disconnect,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Pair => "pair",
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Evaluated top to bottom, first hit wins. "disconnect" must precede
/// "connected", which must precede "connect".
const PHASE_TABLE: &[(Phase, &[&str])] = &[
    (
        Phase::Disconnect,
        &["disconnect", "connection_lost", "link_lost"],
    ),
    (
        Phase::Connected,
        &["connected", "connect_success", "connection_established"],
    ),
    (Phase::Connect, &["connect", "connecting"]),
    (Phase::Pair, &["pair", "bond", "auth"]),
    (Phase::Scan, &["scan", "device_found"]),
];

const ERROR_KEYWORDS: &[&str] = &["error", "fail", "exception", "timeout"];
const TIMEOUT_KEYWORD: &str = "timeout";

pub fn classify_phase(event_name: &str) -> Option<Phase> {
    PHASE_TABLE.iter().find_map(|(phase, keywords)| {
        keywords
            .iter()
            .any(|keyword| contains_ignore_ascii_case(event_name, keyword))
            .then_some(*phase)
    })
}

pub fn is_error_name(event_name: &str) -> bool {
    ERROR_KEYWORDS
        .iter()
        .any(|keyword| contains_ignore_ascii_case(event_name, keyword))
}

pub fn is_timeout_name(event_name: &str) -> bool {
    contains_ignore_ascii_case(event_name, TIMEOUT_KEYWORD)
}

pub fn is_disconnect_name(event_name: &str) -> bool {
    classify_phase(event_name) == Some(Phase::Disconnect)
}

/// Error level or an error keyword in the name.
pub fn is_error_event(event: &EventRecord) -> bool {
    event.is_error_level() || is_error_name(&event.event_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_keywords_resolve_by_table_order() {
        assert_eq!(classify_phase("BLE_DISCONNECTED"), Some(Phase::Disconnect));
        assert_eq!(classify_phase("BLE_CONNECTED"), Some(Phase::Connected));
        assert_eq!(classify_phase("BLE_CONNECT_START"), Some(Phase::Connect));
        assert_eq!(classify_phase("ble_pair_start"), Some(Phase::Pair));
        assert_eq!(classify_phase("BLE_SCAN_DEVICE_FOUND"), Some(Phase::Scan));
        assert_eq!(classify_phase("CGM_SYNC_START"), None);
    }

    #[test]
    fn error_keywords_are_case_insensitive() {
        assert!(is_error_name("GATT_Write_Failed"));
        assert!(is_error_name("CONNECT_TIMEOUT"));
        assert!(is_timeout_name("connect_timeout"));
        assert!(!is_error_name("BLE_CONNECTED"));

        let mut record = EventRecord::new(1, 0, 4, "PLAIN");
        assert!(is_error_event(&record));
        record.level = 2;
        assert!(!is_error_event(&record));
    }
}
