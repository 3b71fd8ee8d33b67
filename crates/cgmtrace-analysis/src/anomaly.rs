//! Windowed density checks and error classification over one event page.

use crate::keywords::{
    classify_phase, is_disconnect_name, is_error_event, is_error_name, is_timeout_name, Phase,
};
use crate::session::reconstruct_sessions;
use cgmtrace_config::AnomalyConfig;
use cgmtrace_ingest_core::EventRecord;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

const COMMAND_MARKERS: &[&str] = &["command", "request", "write"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FrequentDisconnect,
    TimeoutCluster,
    ErrorBurst,
    SlowConnection,
    HighCommandFailureRate,
    ErrorPattern,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrequentDisconnect => "frequent_disconnect",
            Self::TimeoutCluster => "timeout_cluster",
            Self::ErrorBurst => "error_burst",
            Self::SlowConnection => "slow_connection",
            Self::HighCommandFailureRate => "high_command_failure_rate",
            Self::ErrorPattern => "error_pattern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleEvent {
    pub record_id: u64,
    pub timestamp_ms: i64,
    pub event_name: String,
    pub session_key: Option<String>,
    pub error_code: Option<String>,
}

impl From<&EventRecord> for SampleEvent {
    fn from(event: &EventRecord) -> Self {
        Self {
            record_id: event.record_id,
            timestamp_ms: event.timestamp_ms,
            event_name: event.event_name.clone(),
            session_key: event.session_key.clone(),
            error_code: event.error_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub category: Option<String>,
    pub severity: u8,
    pub description: String,
    pub suggestion: String,
    pub occurrences: usize,
    pub sessions: Vec<String>,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub samples: Vec<SampleEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub code: &'static str,
    pub message: &'static str,
    pub triggered_by: Vec<AnomalyKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub anomalies: Vec<Anomaly>,
    pub recommendations: Vec<Recommendation>,
    pub highest_severity: Option<u8>,
}

/// Events falling within one window anchored at the first event.
#[derive(Debug, Clone)]
pub struct EventCluster<'a> {
    pub start_ms: i64,
    pub end_ms: i64,
    pub events: Vec<&'a EventRecord>,
}

impl EventCluster<'_> {
    pub fn size(&self) -> usize {
        self.events.len()
    }
}

/// Greedy time clustering. Clusters never overlap and single events are
/// dropped.
pub fn cluster_by_window<'a>(events: &[&'a EventRecord], window_ms: i64) -> Vec<EventCluster<'a>> {
    let mut sorted = events.to_vec();
    sorted.sort_by_key(|event| event.order_key());

    let mut clusters = Vec::new();
    let mut current: Vec<&'a EventRecord> = Vec::new();
    let close = |current: &mut Vec<&'a EventRecord>, clusters: &mut Vec<EventCluster<'a>>| {
        if current.len() >= 2 {
            clusters.push(EventCluster {
                start_ms: current[0].timestamp_ms,
                end_ms: current[current.len() - 1].timestamp_ms,
                events: std::mem::take(current),
            });
        } else {
            current.clear();
        }
    };

    for event in sorted {
        if let Some(first) = current.first() {
            if event.timestamp_ms - first.timestamp_ms > window_ms {
                close(&mut current, &mut clusters);
            }
        }
        current.push(event);
    }
    close(&mut current, &mut clusters);
    clusters
}

/// +1 at twice the threshold, +2 at four times, clamped to 1..=5.
pub fn escalate(base: u8, count: usize, threshold: usize) -> u8 {
    let bump = if threshold == 0 {
        0
    } else if count >= threshold.saturating_mul(4) {
        2
    } else if count >= threshold.saturating_mul(2) {
        1
    } else {
        0
    };
    base.saturating_add(bump).clamp(1, 5)
}

fn escalate_ratio(base: u8, ratio: f64) -> u8 {
    let bump = if ratio >= 4.0 {
        2
    } else if ratio >= 2.0 {
        1
    } else {
        0
    };
    base.saturating_add(bump).clamp(1, 5)
}

fn distinct_sessions<'a>(events: impl IntoIterator<Item = &'a EventRecord>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for event in events {
        if let Some(key) = &event.session_key {
            seen.insert(key.clone());
        }
    }
    seen.into_iter().collect()
}

fn samples<'a>(events: impl IntoIterator<Item = &'a EventRecord>, max: usize) -> Vec<SampleEvent> {
    events.into_iter().take(max).map(SampleEvent::from).collect()
}

struct ClusterCheck {
    kind: AnomalyKind,
    base_severity: u8,
    window_ms: i64,
    threshold: usize,
    label: &'static str,
    suggestion: &'static str,
}

fn cluster_anomalies(
    check: &ClusterCheck,
    matching: &[&EventRecord],
    max_samples: usize,
) -> Vec<Anomaly> {
    cluster_by_window(matching, check.window_ms)
        .into_iter()
        .filter(|cluster| cluster.size() >= check.threshold)
        .map(|cluster| Anomaly {
            kind: check.kind,
            category: None,
            severity: escalate(check.base_severity, cluster.size(), check.threshold),
            description: format!(
                "{} {} within {} ms",
                cluster.size(),
                check.label,
                cluster.end_ms - cluster.start_ms
            ),
            suggestion: check.suggestion.to_string(),
            occurrences: cluster.size(),
            sessions: distinct_sessions(cluster.events.iter().copied()),
            window_start_ms: cluster.start_ms,
            window_end_ms: cluster.end_ms,
            samples: samples(cluster.events.iter().copied(), max_samples),
        })
        .collect()
}

fn slow_connection_anomaly(
    events: &[EventRecord],
    config: &AnomalyConfig,
) -> Option<Anomaly> {
    let slow: Vec<(String, i64, i64)> = reconstruct_sessions(events)
        .into_iter()
        .filter_map(|session| {
            let elapsed = session.connection_time_ms?;
            let connected_ms = session.connected_ms?;
            (elapsed > config.slow_connection_ms).then_some((
                session.session_key,
                connected_ms - elapsed,
                connected_ms,
            ))
        })
        .collect();
    if slow.is_empty() {
        return None;
    }

    let worst = slow.iter().map(|(_, start, end)| end - start).max().unwrap_or(0);
    let slow_keys: HashSet<&str> = slow.iter().map(|(key, _, _)| key.as_str()).collect();
    let connected_events = events.iter().filter(|event| {
        event
            .session_key
            .as_deref()
            .is_some_and(|key| slow_keys.contains(key))
            && classify_phase(&event.event_name) == Some(Phase::Connected)
    });

    Some(Anomaly {
        kind: AnomalyKind::SlowConnection,
        category: None,
        severity: escalate_ratio(
            2,
            worst as f64 / config.slow_connection_ms.max(1) as f64,
        ),
        description: format!(
            "{} session(s) took longer than {} ms to connect (worst {worst} ms)",
            slow.len(),
            config.slow_connection_ms
        ),
        suggestion: "Review scan filters and connection parameters; check signal strength \
                     near the sensor"
            .to_string(),
        occurrences: slow.len(),
        sessions: {
            let mut keys: Vec<String> = slow.iter().map(|(key, _, _)| key.clone()).collect();
            keys.sort();
            keys
        },
        window_start_ms: slow.iter().map(|(_, start, _)| *start).min().unwrap_or(0),
        window_end_ms: slow.iter().map(|(_, _, end)| *end).max().unwrap_or(0),
        samples: samples(connected_events, config.max_samples),
    })
}

fn command_failure_anomaly(
    events: &[&EventRecord],
    config: &AnomalyConfig,
) -> Option<Anomaly> {
    let commands: Vec<&EventRecord> = events
        .iter()
        .copied()
        .filter(|event| COMMAND_MARKERS.iter().any(|m| event.name_contains(m)))
        .collect();
    if commands.is_empty() || commands.len() < config.command_failure_min_samples {
        return None;
    }
    let failed: Vec<&EventRecord> = commands
        .iter()
        .copied()
        .filter(|event| event.is_error_level())
        .collect();
    let failure_rate = failed.len() as f64 / commands.len() as f64;
    if failure_rate <= config.command_failure_rate {
        return None;
    }

    Some(Anomaly {
        kind: AnomalyKind::HighCommandFailureRate,
        category: None,
        severity: escalate_ratio(3, failure_rate / config.command_failure_rate.max(f64::EPSILON)),
        description: format!(
            "{} of {} commands failed ({:.1}%)",
            failed.len(),
            commands.len(),
            failure_rate * 100.0
        ),
        suggestion: "Inspect GATT write handling and the command retry policy".to_string(),
        occurrences: failed.len(),
        sessions: distinct_sessions(failed.iter().copied()),
        window_start_ms: commands.first().map_or(0, |e| e.timestamp_ms),
        window_end_ms: commands.last().map_or(0, |e| e.timestamp_ms),
        samples: samples(failed.iter().copied(), config.max_samples),
    })
}

struct PatternRule {
    regex: Regex,
    category: &'static str,
    severity: u8,
    suggestion: &'static str,
}

fn pattern_rules() -> &'static [PatternRule] {
    static RULES: OnceLock<Vec<PatternRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"(?i)gatt.*\b(133|0x85)\b",
                "gatt_133",
                4,
                "Close the GATT client, wait briefly and reconnect; clear the GATT cache if it repeats",
            ),
            (
                r"(?i)(bond|pair).*(fail|lost|reject|remove)",
                "pairing_failure",
                4,
                "Remove the bond on the phone and pair the sensor again",
            ),
            (
                r"(?i)(auth|encrypt|key).*(fail|invalid|error|mismatch)",
                "authentication_failure",
                4,
                "Verify the sensor credentials and the encryption key exchange",
            ),
            (
                r"(?i)(write|read|notify|characteristic|descriptor).*(fail|error|reject)",
                "gatt_io_failure",
                3,
                "Check characteristic permissions and serialize GATT operations",
            ),
            (
                r"(?i)(bluetooth|adapter|ble).*(off|disabled|unavailable|unsupported)",
                "bluetooth_unavailable",
                3,
                "Prompt the user to enable Bluetooth before starting a session",
            ),
            (
                r"(?i)(permission|denied|unauthori[sz]ed)",
                "permission_denied",
                3,
                "Request the required Bluetooth and location permissions",
            ),
            (
                r"(?i)(crc|checksum|malformed|corrupt|decode)",
                "data_corruption",
                3,
                "Validate packet framing and retry the affected transfer",
            ),
        ]
        .into_iter()
        .map(|(pattern, category, severity, suggestion)| PatternRule {
            regex: Regex::new(pattern).expect("valid error pattern regex"),
            category,
            severity,
            suggestion,
        })
        .collect()
    })
}

/// Category, base severity and suggestion for one error event.
///
/// The detector only passes error events, so `unknown` is reached only by
/// callers classifying events that are not errors.
pub fn classify_error(event: &EventRecord) -> (&'static str, u8, &'static str) {
    let text = match &event.error_code {
        Some(code) => format!("{} {code}", event.event_name),
        None => event.event_name.clone(),
    };
    if let Some(rule) = pattern_rules().iter().find(|rule| rule.regex.is_match(&text)) {
        return (rule.category, rule.severity, rule.suggestion);
    }

    let name = &event.event_name;
    if is_timeout_name(name) {
        ("timeout", 3, "Check the device range and extend the operation timeout if needed")
    } else if is_disconnect_name(name) {
        ("disconnect", 3, "Check link stability and the reconnection strategy")
    } else if is_error_name(name) || event.is_error_level() {
        ("general_error", 2, "Inspect the surrounding events for the failing operation")
    } else {
        ("unknown", 1, "No specific guidance available")
    }
}

fn pattern_anomalies(errors: &[&EventRecord], config: &AnomalyConfig) -> Vec<Anomaly> {
    let mut order: Vec<&'static str> = Vec::new();
    let mut grouped: HashMap<&'static str, (u8, &'static str, Vec<&EventRecord>)> = HashMap::new();
    for event in errors.iter().copied() {
        let (category, severity, suggestion) = classify_error(event);
        grouped
            .entry(category)
            .or_insert_with(|| {
                order.push(category);
                (severity, suggestion, Vec::new())
            })
            .2
            .push(event);
    }

    order
        .into_iter()
        .filter_map(|category| grouped.remove(category).map(|group| (category, group)))
        .map(|(category, (severity, suggestion, group))| Anomaly {
            kind: AnomalyKind::ErrorPattern,
            category: Some(category.to_string()),
            severity: escalate(severity, group.len(), config.error_threshold),
            description: format!("{} error event(s) classified as {category}", group.len()),
            suggestion: suggestion.to_string(),
            occurrences: group.len(),
            sessions: distinct_sessions(group.iter().copied()),
            window_start_ms: group.first().map_or(0, |e| e.timestamp_ms),
            window_end_ms: group.last().map_or(0, |e| e.timestamp_ms),
            samples: samples(group.iter().copied(), config.max_samples),
        })
        .collect()
}

const RECOMMENDATIONS: &[(&[AnomalyKind], &str, &str)] = &[
    (
        &[AnomalyKind::FrequentDisconnect, AnomalyKind::TimeoutCluster],
        "connectivity_stability",
        "Disconnects and timeouts co-occur: the radio link is unstable. Check RSSI, distance \
         and interference, and tune the supervision timeout.",
    ),
    (
        &[AnomalyKind::SlowConnection, AnomalyKind::TimeoutCluster],
        "connection_setup",
        "Connection setup is slow and times out: narrow scan filters and review connection \
         parameters.",
    ),
    (
        &[AnomalyKind::SlowConnection, AnomalyKind::FrequentDisconnect],
        "reconnect_strategy",
        "Slow connections followed by drops: back off reconnect attempts and keep the bond.",
    ),
    (
        &[AnomalyKind::ErrorBurst, AnomalyKind::HighCommandFailureRate],
        "command_pipeline",
        "Command failures arrive in bursts: serialize GATT writes and retry with backoff.",
    ),
    (
        &[AnomalyKind::FrequentDisconnect, AnomalyKind::HighCommandFailureRate],
        "link_loss_during_commands",
        "Commands fail around disconnects: gate command dispatch on a confirmed connection.",
    ),
];

pub fn recommend(anomalies: &[Anomaly]) -> Vec<Recommendation> {
    let present: HashSet<AnomalyKind> = anomalies.iter().map(|a| a.kind).collect();
    RECOMMENDATIONS
        .iter()
        .filter(|(kinds, _, _)| kinds.iter().all(|kind| present.contains(kind)))
        .map(|&(kinds, code, message)| Recommendation {
            code,
            message,
            triggered_by: kinds.to_vec(),
        })
        .collect()
}

pub fn detect_anomalies(events: &[EventRecord], config: &AnomalyConfig) -> AnomalyReport {
    // Parser errors carry wall-clock time and would distort every window.
    let observed: Vec<&EventRecord> = events.iter().filter(|e| !e.is_parser_error()).collect();

    let disconnects: Vec<&EventRecord> = observed
        .iter()
        .copied()
        .filter(|e| is_disconnect_name(&e.event_name))
        .collect();
    let timeouts: Vec<&EventRecord> = observed
        .iter()
        .copied()
        .filter(|e| is_timeout_name(&e.event_name))
        .collect();
    let error_level: Vec<&EventRecord> = observed
        .iter()
        .copied()
        .filter(|e| e.is_error_level())
        .collect();
    let errors: Vec<&EventRecord> = observed
        .iter()
        .copied()
        .filter(|e| is_error_event(e))
        .collect();

    let checks = [
        (
            ClusterCheck {
                kind: AnomalyKind::FrequentDisconnect,
                base_severity: 3,
                window_ms: config.disconnect_window_ms,
                threshold: config.disconnect_threshold,
                label: "disconnects",
                suggestion: "Check signal strength and interference; review the reconnection policy",
            },
            &disconnects,
        ),
        (
            ClusterCheck {
                kind: AnomalyKind::TimeoutCluster,
                base_severity: 3,
                window_ms: config.timeout_window_ms,
                threshold: config.timeout_threshold,
                label: "timeouts",
                suggestion: "Check device range and battery; consider longer operation timeouts",
            },
            &timeouts,
        ),
        (
            ClusterCheck {
                kind: AnomalyKind::ErrorBurst,
                base_severity: 4,
                window_ms: config.error_window_ms,
                threshold: config.error_threshold,
                label: "error-level events",
                suggestion: "Inspect the burst window for a common failing operation",
            },
            &error_level,
        ),
    ];

    let mut anomalies: Vec<Anomaly> = checks
        .iter()
        .flat_map(|(check, matching)| cluster_anomalies(check, matching, config.max_samples))
        .collect();
    // Parser errors have no session key so they never reach a session.
    anomalies.extend(slow_connection_anomaly(events, config));
    anomalies.extend(command_failure_anomaly(&observed, config));
    anomalies.extend(pattern_anomalies(&errors, config));

    anomalies.sort_by(|a, b| b.severity.cmp(&a.severity));

    AnomalyReport {
        recommendations: recommend(&anomalies),
        highest_severity: anomalies.first().map(|a| a.severity),
        anomalies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: u64, ts: i64, name: &str) -> EventRecord {
        EventRecord::new(id, ts, 2, name).with_session("S1")
    }

    fn refs(events: &[EventRecord]) -> Vec<&EventRecord> {
        events.iter().collect()
    }

    #[test]
    fn dense_disconnects_form_one_cluster_and_anomaly() {
        let events = vec![
            ev(1, 0, "BLE_DISCONNECTED"),
            ev(2, 10_000, "BLE_DISCONNECTED"),
            ev(3, 20_000, "BLE_DISCONNECTED"),
        ];
        let clusters = cluster_by_window(&refs(&events), 60_000);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size(), 3);

        let report = detect_anomalies(&events, &AnomalyConfig::default());
        let disconnect = report
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::FrequentDisconnect)
            .expect("frequent disconnect");
        assert_eq!(disconnect.occurrences, 3);
        assert_eq!(disconnect.window_start_ms, 0);
        assert_eq!(disconnect.window_end_ms, 20_000);
        assert_eq!(disconnect.sessions, vec!["S1".to_string()]);
    }

    #[test]
    fn sparse_disconnects_do_not_cluster() {
        let events = vec![
            ev(1, 0, "BLE_DISCONNECTED"),
            ev(2, 70_000, "BLE_DISCONNECTED"),
            ev(3, 140_000, "BLE_DISCONNECTED"),
        ];
        assert!(cluster_by_window(&refs(&events), 60_000).is_empty());
        let report = detect_anomalies(&events, &AnomalyConfig::default());
        assert!(report
            .anomalies
            .iter()
            .all(|a| a.kind != AnomalyKind::FrequentDisconnect));
    }

    #[test]
    fn clusters_never_overlap_and_have_two_members() {
        let stamps = [0_i64, 5, 7, 100, 104, 250, 251, 252, 400, 900, 905, 2000];
        let events: Vec<EventRecord> = stamps
            .iter()
            .enumerate()
            .map(|(i, ts)| ev(i as u64, *ts, "X"))
            .collect();
        let clusters = cluster_by_window(&refs(&events), 10);
        assert!(clusters.iter().all(|c| c.size() >= 2));
        for pair in clusters.windows(2) {
            assert!(pair[0].end_ms < pair[1].start_ms);
        }
        assert_eq!(clusters.len(), 4);
    }

    #[test]
    fn escalation_steps_and_clamps() {
        assert_eq!(escalate(3, 3, 3), 3);
        assert_eq!(escalate(3, 6, 3), 4);
        assert_eq!(escalate(3, 12, 3), 5);
        assert_eq!(escalate(5, 100, 3), 5);
        assert_eq!(escalate(0, 1, 3), 1);
    }

    #[test]
    fn command_failure_rate_needs_minimum_samples() {
        let mut events: Vec<EventRecord> = (0..6)
            .map(|i| ev(i, i as i64 * 100, "COMMAND_WRITE"))
            .collect();
        events[1].level = 4;
        events[4].level = 4;
        let config = AnomalyConfig::default();
        let anomaly = command_failure_anomaly(&refs(&events), &config).expect("rate above 0.3");
        assert_eq!(anomaly.occurrences, 2);
        assert_eq!(anomaly.samples.len(), 2);

        assert!(command_failure_anomaly(&refs(&events[..4]), &config).is_none());
    }

    #[test]
    fn slow_connection_is_flagged() {
        let events = vec![ev(1, 0, "BLE_SCAN_START"), ev(2, 12_000, "BLE_CONNECTED")];
        let report = detect_anomalies(&events, &AnomalyConfig::default());
        let slow = report
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::SlowConnection)
            .expect("slow connection");
        assert_eq!(slow.severity, 2);
        assert_eq!(slow.window_start_ms, 0);
        assert_eq!(slow.window_end_ms, 12_000);
        assert_eq!(slow.samples.len(), 1);
    }

    #[test]
    fn error_patterns_classify_with_fallbacks() {
        let gatt = ev(1, 0, "GATT_ERROR").with_error_code("133");
        assert_eq!(classify_error(&gatt).0, "gatt_133");
        assert_eq!(classify_error(&ev(2, 0, "BOND_FAILED")).0, "pairing_failure");
        assert_eq!(classify_error(&ev(3, 0, "SYNC_TIMEOUT")).0, "timeout");
        assert_eq!(classify_error(&ev(4, 0, "LINK_LOST")).0, "disconnect");
        assert_eq!(classify_error(&ev(5, 0, "SYNC_EXCEPTION")).0, "general_error");
        assert_eq!(classify_error(&ev(6, 0, "SYNC_START")).0, "unknown");
    }

    #[test]
    fn detector_never_classifies_non_error_events() {
        let events: Vec<EventRecord> = (0..20).map(|i| ev(i, i as i64 * 10, "SYNC_START")).collect();
        let report = detect_anomalies(&events, &AnomalyConfig::default());
        assert!(report
            .anomalies
            .iter()
            .all(|a| a.kind != AnomalyKind::ErrorPattern));
    }

    #[test]
    fn anomalies_sorted_by_severity_with_recommendations() {
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(ev(i, i as i64 * 1_000, "BLE_DISCONNECTED"));
        }
        for i in 3..5 {
            events.push(ev(i, i as i64 * 1_000, "CONNECT_TIMEOUT"));
        }
        let report = detect_anomalies(&events, &AnomalyConfig::default());
        let severities: Vec<u8> = report.anomalies.iter().map(|a| a.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
        assert_eq!(report.highest_severity, severities.first().copied());
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.code == "connectivity_stability"));
    }

    #[test]
    fn empty_input_is_quiet() {
        let report = detect_anomalies(&[], &AnomalyConfig::default());
        assert!(report.anomalies.is_empty());
        assert!(report.recommendations.is_empty());
        assert_eq!(report.highest_severity, None);
    }
}
