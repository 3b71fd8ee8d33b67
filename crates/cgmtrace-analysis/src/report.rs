use crate::anomaly::{detect_anomalies, AnomalyReport};
use crate::chain::{correlate_chains, ChainReport};
use crate::coverage::{analyze_coverage, event_frequencies, CoverageReport};
use crate::flow::{analyze_flow, FlowReport};
use crate::session::{reconstruct_sessions, SessionReport};
use anyhow::{Context, Result};
use cgmtrace_config::{AnomalyConfig, AppConfig, EventCatalog, FlowTemplate};
use cgmtrace_ingest_core::{EventQuery, EventRecord, EventStore, FileRunCoordinator, RunOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

/// Read-only inputs shared by every analyzer.
#[derive(Debug, Clone, Default)]
pub struct AnalysisSettings {
    pub anomaly: AnomalyConfig,
    pub flow: FlowTemplate,
    pub catalog: EventCatalog,
    pub page_size: usize,
}

impl AnalysisSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            anomaly: config.anomaly.clone(),
            flow: config.flow.clone(),
            catalog: config.catalog.clone(),
            page_size: config.ingest.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityScore {
    pub score: f64,
    pub grade: &'static str,
    pub flow_completion: f64,
    pub event_coverage: f64,
    pub stability: f64,
    pub parser_error_ratio: f64,
}

impl QualityScore {
    /// Weighted blend of flow completion, catalog coverage and anomaly
    /// pressure, discounted by the share of unparseable lines.
    pub fn compute(
        flow: &FlowReport,
        coverage: &CoverageReport,
        anomalies: &AnomalyReport,
        total_events: usize,
        parser_errors: usize,
    ) -> Self {
        let penalty: f64 = anomalies
            .anomalies
            .iter()
            .map(|a| f64::from(a.severity) * 5.0)
            .sum();
        let stability = (100.0 - penalty).max(0.0);
        let parser_error_ratio = if total_events == 0 {
            0.0
        } else {
            parser_errors as f64 / total_events as f64
        };

        let score = if total_events == 0 {
            0.0
        } else {
            let blended = 0.4 * flow.completion_rate
                + 0.3 * coverage.coverage_rate
                + 0.3 * stability;
            (blended * (1.0 - parser_error_ratio)).clamp(0.0, 100.0)
        };

        let grade = match score {
            s if s >= 90.0 => "A",
            s if s >= 75.0 => "B",
            s if s >= 60.0 => "C",
            s if s >= 40.0 => "D",
            _ => "F",
        };

        Self {
            score,
            grade,
            flow_completion: flow.completion_rate,
            event_coverage: coverage.coverage_rate,
            stability,
            parser_error_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAnalysis {
    pub total_events: usize,
    /// The load hit the page size, so later events in the file were not analyzed.
    pub truncated: bool,
    pub parser_errors: usize,
    pub first_event_ms: Option<i64>,
    pub last_event_ms: Option<i64>,
    pub sessions: Vec<SessionReport>,
    pub chains: ChainReport,
    pub flow: FlowReport,
    pub coverage: CoverageReport,
    pub anomalies: AnomalyReport,
    pub quality: QualityScore,
}

impl FileAnalysis {
    fn assemble(
        events: &[EventRecord],
        sessions: Vec<SessionReport>,
        chains: ChainReport,
        flow: FlowReport,
        coverage: CoverageReport,
        anomalies: AnomalyReport,
    ) -> Self {
        let parser_errors = events.iter().filter(|e| e.is_parser_error()).count();
        let mut observed = events.iter().filter(|e| !e.is_parser_error());
        let first_event_ms = observed.next().map(|e| e.timestamp_ms);
        let last_event_ms = observed.last().map(|e| e.timestamp_ms).or(first_event_ms);
        let quality =
            QualityScore::compute(&flow, &coverage, &anomalies, events.len(), parser_errors);

        Self {
            total_events: events.len(),
            truncated: false,
            parser_errors,
            first_event_ms,
            last_event_ms,
            sessions,
            chains,
            flow,
            coverage,
            anomalies,
            quality,
        }
    }
}

/// Runs every analyzer in sequence on the calling thread.
pub fn analyze_events(events: &[EventRecord], settings: &AnalysisSettings) -> FileAnalysis {
    let freq = event_frequencies(events);
    FileAnalysis::assemble(
        events,
        reconstruct_sessions(events),
        correlate_chains(events),
        analyze_flow(events, &settings.flow),
        analyze_coverage(&freq, &settings.catalog),
        detect_anomalies(events, &settings.anomaly),
    )
}

async fn fan_out(
    events: Arc<Vec<EventRecord>>,
    freq: BTreeMap<String, u64>,
    settings: Arc<AnalysisSettings>,
) -> Result<FileAnalysis> {
    let sessions = spawn_blocking({
        let events = events.clone();
        move || reconstruct_sessions(&events)
    });
    let chains = spawn_blocking({
        let events = events.clone();
        move || correlate_chains(&events)
    });
    let flow = spawn_blocking({
        let events = events.clone();
        let settings = settings.clone();
        move || analyze_flow(&events, &settings.flow)
    });
    let coverage = spawn_blocking({
        let settings = settings.clone();
        move || analyze_coverage(&freq, &settings.catalog)
    });
    let anomalies = spawn_blocking({
        let events = events.clone();
        let settings = settings.clone();
        move || detect_anomalies(&events, &settings.anomaly)
    });

    let (sessions, chains, flow, coverage, anomalies) =
        tokio::try_join!(sessions, chains, flow, coverage, anomalies)
            .context("analysis task failed to complete")?;

    Ok(FileAnalysis::assemble(
        &events, sessions, chains, flow, coverage, anomalies,
    ))
}

/// Fans the analyzers out on the blocking pool and joins their results.
pub async fn analyze_events_concurrently(
    events: Arc<Vec<EventRecord>>,
    settings: Arc<AnalysisSettings>,
) -> Result<FileAnalysis> {
    let freq = event_frequencies(&events);
    fan_out(events, freq, settings).await
}

/// Loads one ordered page from `store` and analyzes it.
///
/// Whole-file queries use the stored frequency table for coverage; scoped
/// or truncated loads count only the events they loaded.
pub async fn analyze_file(
    store: &dyn EventStore,
    file_id: &str,
    mut query: EventQuery,
    settings: Arc<AnalysisSettings>,
) -> Result<FileAnalysis> {
    if query.limit.is_none() && settings.page_size > 0 {
        query.limit = Some(settings.page_size);
    }
    let page_limit = query.limit;
    // One extra row tells a full page apart from a truncated one.
    query.limit = page_limit.map(|limit| limit.saturating_add(1));

    let mut events = store
        .load_events(file_id, &query)
        .await
        .with_context(|| format!("failed to load events for {file_id}"))?;
    let truncated = page_limit.is_some_and(|limit| events.len() > limit);
    if let Some(limit) = page_limit {
        events.truncate(limit);
    }
    if truncated {
        warn!(
            "{file_id}: analysis limited to the first {} events",
            events.len()
        );
    }

    let whole_file =
        query.session_key.is_none() && query.from_ms.is_none() && query.to_ms.is_none();
    let freq = if whole_file && !truncated {
        store
            .event_frequencies(file_id)
            .await
            .with_context(|| format!("failed to load event frequencies for {file_id}"))?
    } else {
        event_frequencies(&events)
    };
    debug!(
        "{file_id}: analyzing {} events ({} distinct names)",
        events.len(),
        freq.len()
    );

    let mut analysis = fan_out(Arc::new(events), freq, settings).await?;
    analysis.truncated = truncated;
    info!(
        "{file_id}: {} sessions, {} chains, {} anomalies, quality {:.1} ({})",
        analysis.sessions.len(),
        analysis.chains.stats.total,
        analysis.anomalies.anomalies.len(),
        analysis.quality.score,
        analysis.quality.grade
    );
    Ok(analysis)
}

/// Store-backed analyzer that coalesces overlapping runs per file.
pub struct FileAnalyzer {
    store: Arc<dyn EventStore>,
    settings: Arc<AnalysisSettings>,
    runs: FileRunCoordinator,
}

impl FileAnalyzer {
    pub fn new(store: Arc<dyn EventStore>, settings: Arc<AnalysisSettings>) -> Self {
        Self {
            store,
            settings,
            runs: FileRunCoordinator::new(),
        }
    }

    /// Returns `None` when another caller is already analyzing `file_id`; that
    /// caller reruns once more so the newest data is still covered.
    pub async fn analyze(&self, file_id: &str) -> Result<Option<FileAnalysis>> {
        let outcome = self
            .runs
            .run(file_id, || {
                analyze_file(
                    self.store.as_ref(),
                    file_id,
                    EventQuery::default(),
                    self.settings.clone(),
                )
            })
            .await;

        match outcome {
            RunOutcome::Completed { result, runs } => {
                if runs > 1 {
                    debug!("{file_id}: analysis rerun {runs} times");
                }
                result.map(Some)
            }
            RunOutcome::Deferred => {
                debug!("{file_id}: analysis already in flight, deferred");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmtrace_ingest_core::MemoryEventStore;

    fn ev(id: u64, ts: i64, name: &str, session: &str) -> EventRecord {
        EventRecord::new(id, ts, 2, name).with_session(session)
    }

    fn sample_events() -> Vec<EventRecord> {
        vec![
            ev(1, 0, "BLE_SCAN_START", "L1"),
            ev(2, 200, "BLE_SCAN_DEVICE_FOUND", "L1"),
            ev(3, 300, "BLE_CONNECT_START", "L1"),
            ev(4, 900, "BLE_CONNECTED", "L1"),
            ev(5, 1_000, "BLE_PAIR_START", "L1"),
            ev(6, 1_400, "BLE_PAIR_SUCCESS", "L1"),
            ev(7, 1_500, "COMMAND_WRITE", "L1").with_request("R1"),
            ev(8, 1_650, "COMMAND_RESPONSE", "L1").with_request("R1"),
            ev(9, 2_000, "BLE_SCAN_START", "L2"),
        ]
    }

    #[test]
    fn sequential_analysis_covers_every_section() {
        let analysis = analyze_events(&sample_events(), &AnalysisSettings::default());
        assert_eq!(analysis.total_events, 9);
        assert_eq!(analysis.parser_errors, 0);
        assert_eq!(analysis.first_event_ms, Some(0));
        assert_eq!(analysis.last_event_ms, Some(2_000));
        assert_eq!(analysis.sessions.len(), 2);
        assert_eq!(analysis.chains.stats.success, 1);
        assert_eq!(analysis.flow.total_sessions, 2);
        assert_eq!(analysis.flow.completed_sessions, 1);
        assert!(analysis.coverage.covered > 0);
        assert!(analysis.quality.score > 0.0 && analysis.quality.score <= 100.0);
    }

    #[test]
    fn empty_input_yields_zero_report() {
        let analysis = analyze_events(&[], &AnalysisSettings::default());
        assert_eq!(analysis.total_events, 0);
        assert!(analysis.sessions.is_empty());
        assert_eq!(analysis.chains.stats.total, 0);
        assert_eq!(analysis.flow.completion_rate, 0.0);
        assert_eq!(analysis.quality.score, 0.0);
        assert_eq!(analysis.first_event_ms, None);
    }

    #[tokio::test]
    async fn concurrent_matches_sequential() {
        let events = sample_events();
        let settings = AnalysisSettings::default();
        let sequential = analyze_events(&events, &settings);
        let concurrent = analyze_events_concurrently(Arc::new(events), Arc::new(settings))
            .await
            .expect("concurrent analysis");
        assert_eq!(sequential, concurrent);
    }

    #[tokio::test]
    async fn analyzer_reads_from_store() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .replace_file_events("f", sample_events())
            .await
            .expect("seed store");

        let settings = Arc::new(AnalysisSettings::from_config(&AppConfig::default()));
        let analyzer = FileAnalyzer::new(store.clone(), settings.clone());
        let analysis = analyzer
            .analyze("f")
            .await
            .expect("analysis")
            .expect("not deferred");
        assert_eq!(analysis.total_events, 9);

        let scoped = analyze_file(store.as_ref(), "f", EventQuery::for_session("L2"), settings)
            .await
            .expect("session analysis");
        assert_eq!(scoped.total_events, 1);
        assert_eq!(scoped.sessions[0].session_key, "L2");
        assert!(!analysis.truncated);
    }

    #[tokio::test]
    async fn truncated_page_keeps_coverage_on_loaded_events() {
        let store = MemoryEventStore::new();
        store
            .replace_file_events("f", sample_events())
            .await
            .expect("seed store");

        let mut settings = AnalysisSettings::from_config(&AppConfig::default());
        settings.page_size = 4;
        let analysis = analyze_file(&store, "f", EventQuery::default(), Arc::new(settings.clone()))
            .await
            .expect("paged analysis");
        assert!(analysis.truncated);
        assert_eq!(analysis.total_events, 4);
        assert_eq!(analysis.coverage.observed_names, 4);
        assert_eq!(analysis.last_event_ms, Some(900));

        settings.page_size = 9;
        let exact = analyze_file(&store, "f", EventQuery::default(), Arc::new(settings))
            .await
            .expect("full page analysis");
        assert!(!exact.truncated);
        assert_eq!(exact.total_events, 9);
        assert_eq!(exact.coverage.observed_names, 8);
    }
}
