use crate::grouping::group_by_request;
use crate::keywords::is_timeout_name;
use crate::stats::DurationStats;
use cgmtrace_ingest_core::EventRecord;
use serde::Serialize;
use std::collections::BTreeMap;

const SUCCESS_MARKERS: &[&str] = &["success", "response", "complete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandChain {
    pub request_key: String,
    pub session_key: Option<String>,
    pub command: String,
    pub status: ChainStatus,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
    pub event_count: usize,
    pub error_code: Option<String>,
}

impl CommandChain {
    fn start(request_key: &str, first: &EventRecord) -> Self {
        Self {
            request_key: request_key.to_string(),
            session_key: first.session_key.clone(),
            command: first.event_name.clone(),
            status: ChainStatus::Pending,
            start_ms: first.timestamp_ms,
            end_ms: first.timestamp_ms,
            duration_ms: 0,
            event_count: 1,
            error_code: first.error_code.clone(),
        }
    }

    /// Later events overwrite earlier status in either direction.
    fn advance(&mut self, event: &EventRecord) {
        self.event_count += 1;
        self.end_ms = event.timestamp_ms;
        self.duration_ms = self.end_ms - self.start_ms;
        if self.session_key.is_none() {
            self.session_key = event.session_key.clone();
        }
        if event.error_code.is_some() {
            self.error_code = event.error_code.clone();
        }

        if event.is_error_level() || event.error_code.is_some() {
            self.status = if is_timeout_name(&event.event_name) {
                ChainStatus::Timeout
            } else {
                ChainStatus::Error
            };
        } else if SUCCESS_MARKERS.iter().any(|m| event.name_contains(m)) {
            self.status = ChainStatus::Success;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainCounts {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub timeout: usize,
    pub pending: usize,
    /// Chains that never saw a terminating event.
    pub missing_end: usize,
    pub durations: DurationStats,
}

impl ChainCounts {
    fn from_chains<'a>(chains: impl IntoIterator<Item = &'a CommandChain>) -> Self {
        let mut counts = Self::default();
        let mut durations = Vec::new();
        for chain in chains {
            counts.total += 1;
            match chain.status {
                ChainStatus::Pending => counts.pending += 1,
                ChainStatus::Success => counts.success += 1,
                ChainStatus::Error => counts.error += 1,
                ChainStatus::Timeout => counts.timeout += 1,
            }
            durations.push(chain.duration_ms);
        }
        counts.missing_end = counts.pending;
        counts.durations = DurationStats::from_durations(durations);
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandBreakdown {
    pub command: String,
    #[serde(flatten)]
    pub counts: ChainCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainReport {
    pub chains: Vec<CommandChain>,
    pub stats: ChainCounts,
    pub by_command: Vec<CommandBreakdown>,
}

pub fn correlate_chain<'a>(
    request_key: &str,
    events: impl IntoIterator<Item = &'a EventRecord>,
) -> Option<CommandChain> {
    let mut events = events.into_iter();
    let mut chain = CommandChain::start(request_key, events.next()?);
    for event in events {
        chain.advance(event);
    }
    Some(chain)
}

pub fn correlate_chains(events: &[EventRecord]) -> ChainReport {
    let chains: Vec<CommandChain> = group_by_request(events)
        .iter()
        .filter_map(|(key, group)| correlate_chain(key, group.iter().copied()))
        .collect();

    let mut per_command: BTreeMap<&str, Vec<&CommandChain>> = BTreeMap::new();
    for chain in &chains {
        per_command.entry(chain.command.as_str()).or_default().push(chain);
    }
    let by_command = per_command
        .into_iter()
        .map(|(command, group)| CommandBreakdown {
            command: command.to_string(),
            counts: ChainCounts::from_chains(group),
        })
        .collect();

    ChainReport {
        stats: ChainCounts::from_chains(&chains),
        by_command,
        chains,
    }
}
