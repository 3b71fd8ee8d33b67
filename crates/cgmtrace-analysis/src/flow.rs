//! Scores sessions against the configured flow template.
//!
//! Each stage of each session resolves a set of duration candidates. The
//! attempt scan runs first, then an unpartitioned sequential scan, then a
//! first-to-last range. The first method that yields anything wins. The
//! longest candidate is the session's selected timing; population
//! statistics use every candidate.

use crate::grouping::{group_by_attempt, group_by_session};
use crate::stats::rate;
use cgmtrace_config::{FlowStage, FlowTemplate};
use cgmtrace_ingest_core::EventRecord;
use serde::Serialize;

pub const TIMEOUT_SEVERITY: u8 = 3;
pub const MISSING_EVENT_SEVERITY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageCandidate {
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationMethod {
    Attempt,
    Sequential,
    Range,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStage {
    pub stage: String,
    pub matched_events: usize,
    pub reached: bool,
    pub completed: bool,
    pub seen_events: Vec<String>,
    pub missing_events: Vec<String>,
    pub method: Option<DurationMethod>,
    pub candidates: Vec<StageCandidate>,
    pub selected: Option<StageCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFlow {
    pub session_key: String,
    pub completed: bool,
    pub stages: Vec<SessionStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowIssueKind {
    Timeout,
    MissingEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowIssue {
    pub kind: FlowIssueKind,
    pub severity: u8,
    pub stage: String,
    pub event_name: Option<String>,
    pub description: String,
    pub occurrences: usize,
    pub session_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventHit {
    pub event_name: String,
    pub required: bool,
    pub sessions: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub name: String,
    pub required: bool,
    pub max_duration_ms: Option<i64>,
    pub sessions_reached: usize,
    pub coverage_rate: f64,
    pub completed_sessions: usize,
    pub candidate_count: usize,
    pub avg_duration_ms: Option<f64>,
    pub min_duration_ms: Option<i64>,
    pub max_observed_duration_ms: Option<i64>,
    pub timeout_count: usize,
    pub events: Vec<EventHit>,
    pub issues: Vec<FlowIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowReport {
    pub template_version: String,
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub completion_rate: f64,
    pub stages: Vec<StageResult>,
    pub samples: Vec<SessionFlow>,
}

fn scan_markers<'a>(
    stage: &FlowStage,
    events: impl IntoIterator<Item = &'a EventRecord>,
) -> Vec<StageCandidate> {
    let Some(start_marker) = stage.start_marker() else {
        return Vec::new();
    };
    let mut pending_start: Option<i64> = None;
    let mut out = Vec::new();
    for event in events {
        if event.event_name == start_marker {
            pending_start = Some(event.timestamp_ms);
        } else if stage.is_end_marker(&event.event_name) {
            if let Some(start_ms) = pending_start {
                if event.timestamp_ms >= start_ms {
                    out.push(StageCandidate {
                        start_ms,
                        end_ms: event.timestamp_ms,
                        duration_ms: event.timestamp_ms - start_ms,
                    });
                    pending_start = None;
                }
            }
        }
    }
    out
}

/// Duration candidates for one session's matched stage events.
pub fn resolve_stage_durations(
    stage: &FlowStage,
    matched: &[&EventRecord],
) -> Option<(DurationMethod, Vec<StageCandidate>)> {
    let attempts = group_by_attempt(matched);
    let by_attempt: Vec<StageCandidate> = attempts
        .iter()
        .flat_map(|(_, group)| scan_markers(stage, group.iter().copied()))
        .collect();
    if !by_attempt.is_empty() {
        return Some((DurationMethod::Attempt, by_attempt));
    }

    let sequential = scan_markers(stage, matched.iter().copied());
    if !sequential.is_empty() {
        return Some((DurationMethod::Sequential, sequential));
    }

    match (matched.first(), matched.last()) {
        (Some(first), Some(last)) => Some((
            DurationMethod::Range,
            vec![StageCandidate {
                start_ms: first.timestamp_ms,
                end_ms: last.timestamp_ms,
                duration_ms: last.timestamp_ms - first.timestamp_ms,
            }],
        )),
        _ => None,
    }
}

fn evaluate_stage(stage: &FlowStage, session_events: &[&EventRecord]) -> SessionStage {
    let matched: Vec<&EventRecord> = session_events
        .iter()
        .copied()
        .filter(|event| stage.contains_event(&event.event_name))
        .collect();

    let mut seen_events: Vec<String> = Vec::new();
    for event in &matched {
        if !seen_events.contains(&event.event_name) {
            seen_events.push(event.event_name.clone());
        }
    }

    let missing_events: Vec<String> = stage
        .required_events()
        .filter(|required| {
            !matched
                .iter()
                .any(|event| event.event_name == required.event_name)
        })
        .map(|required| required.event_name.clone())
        .collect();

    let (method, candidates) = match resolve_stage_durations(stage, &matched) {
        Some((method, candidates)) => (Some(method), candidates),
        None => (None, Vec::new()),
    };
    let selected = candidates.iter().copied().max_by_key(|c| c.duration_ms);

    SessionStage {
        stage: stage.name.clone(),
        matched_events: matched.len(),
        reached: !matched.is_empty(),
        completed: missing_events.is_empty(),
        seen_events,
        missing_events,
        method,
        candidates,
        selected,
    }
}

pub fn evaluate_session(
    template: &FlowTemplate,
    session_key: &str,
    events: &[&EventRecord],
) -> SessionFlow {
    let stages: Vec<SessionStage> = template
        .stages
        .iter()
        .map(|stage| evaluate_stage(stage, events))
        .collect();
    let completed = template
        .stages
        .iter()
        .zip(&stages)
        .all(|(stage, result)| !stage.required || result.completed);

    SessionFlow {
        session_key: session_key.to_string(),
        completed,
        stages,
    }
}

fn summarize_stage(stage: &FlowStage, index: usize, flows: &[SessionFlow]) -> StageResult {
    let total = flows.len();
    let results: Vec<(&str, &SessionStage)> = flows
        .iter()
        .filter_map(|flow| {
            flow.stages
                .get(index)
                .map(|result| (flow.session_key.as_str(), result))
        })
        .collect();

    let sessions_reached = results.iter().filter(|(_, r)| r.reached).count();
    let completed_sessions = results.iter().filter(|(_, r)| r.completed).count();

    let durations: Vec<i64> = results
        .iter()
        .flat_map(|(_, r)| r.candidates.iter().map(|c| c.duration_ms))
        .collect();
    let avg_duration_ms = (!durations.is_empty())
        .then(|| durations.iter().sum::<i64>() as f64 / durations.len() as f64);

    let mut issues = Vec::new();
    let mut timeout_count = 0;
    if let Some(limit) = stage.max_duration_ms {
        let mut offenders = Vec::new();
        for (key, result) in &results {
            let over = result
                .candidates
                .iter()
                .filter(|c| c.duration_ms > limit)
                .count();
            if over > 0 {
                timeout_count += over;
                offenders.push(key.to_string());
            }
        }
        if timeout_count > 0 {
            issues.push(FlowIssue {
                kind: FlowIssueKind::Timeout,
                severity: TIMEOUT_SEVERITY,
                stage: stage.name.clone(),
                event_name: None,
                description: format!(
                    "{} exceeded {limit} ms in {timeout_count} attempt(s)",
                    stage.name
                ),
                occurrences: timeout_count,
                session_keys: offenders,
            });
        }
    }

    // Optional stages only judge sessions that actually entered them.
    for required in stage.required_events() {
        let affected: Vec<String> = results
            .iter()
            .filter(|(_, r)| stage.required || r.reached)
            .filter(|(_, r)| r.missing_events.contains(&required.event_name))
            .map(|(key, _)| key.to_string())
            .collect();
        if affected.is_empty() {
            continue;
        }
        issues.push(FlowIssue {
            kind: FlowIssueKind::MissingEvent,
            severity: MISSING_EVENT_SEVERITY,
            stage: stage.name.clone(),
            event_name: Some(required.event_name.clone()),
            description: format!(
                "{} missing from {} of {total} session(s)",
                required.event_name,
                affected.len()
            ),
            occurrences: affected.len(),
            session_keys: affected,
        });
    }

    let events = stage
        .events
        .iter()
        .map(|stage_event| {
            let sessions = flows
                .iter()
                .filter(|flow| flow_contains(flow, index, &stage_event.event_name))
                .count();
            EventHit {
                event_name: stage_event.event_name.clone(),
                required: stage_event.required,
                sessions,
                hit_rate: rate(sessions, total),
            }
        })
        .collect();

    StageResult {
        name: stage.name.clone(),
        required: stage.required,
        max_duration_ms: stage.max_duration_ms,
        sessions_reached,
        coverage_rate: rate(sessions_reached, total),
        completed_sessions,
        candidate_count: durations.len(),
        avg_duration_ms,
        min_duration_ms: durations.iter().copied().min(),
        max_observed_duration_ms: durations.iter().copied().max(),
        timeout_count,
        events,
        issues,
    }
}

fn flow_contains(flow: &SessionFlow, index: usize, event_name: &str) -> bool {
    flow.stages
        .get(index)
        .is_some_and(|result| result.seen_events.iter().any(|seen| seen == event_name))
}

pub fn analyze_flow(events: &[EventRecord], template: &FlowTemplate) -> FlowReport {
    let sessions = group_by_session(events);
    let flows: Vec<SessionFlow> = sessions
        .iter()
        .map(|(key, group)| evaluate_session(template, key, group))
        .collect();

    let total_sessions = flows.len();
    let completed_sessions = flows.iter().filter(|flow| flow.completed).count();
    let stages = template
        .stages
        .iter()
        .enumerate()
        .map(|(index, stage)| summarize_stage(stage, index, &flows))
        .collect();

    let samples: Vec<SessionFlow> = flows
        .iter()
        .filter(|flow| !flow.completed)
        .chain(flows.iter().filter(|flow| flow.completed))
        .take(template.sample_sessions)
        .cloned()
        .collect();

    FlowReport {
        template_version: template.version.clone(),
        total_sessions,
        completed_sessions,
        completion_rate: rate(completed_sessions, total_sessions),
        stages,
        samples,
    }
}
