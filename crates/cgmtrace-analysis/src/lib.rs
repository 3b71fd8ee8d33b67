pub mod anomaly;
pub mod chain;
pub mod coverage;
pub mod flow;
pub mod grouping;
pub mod keywords;
mod report;
pub mod session;
pub mod stats;

pub use anomaly::{
    cluster_by_window, detect_anomalies, Anomaly, AnomalyKind, AnomalyReport, EventCluster,
    Recommendation,
};
pub use chain::{correlate_chains, ChainReport, ChainStatus, CommandChain};
pub use coverage::{analyze_coverage, event_frequencies, CoverageReport};
pub use flow::{analyze_flow, FlowIssue, FlowIssueKind, FlowReport, StageResult};
pub use grouping::{group_by_attempt, group_by_request, group_by_session, KeyedGroups};
pub use keywords::{classify_phase, Phase};
pub use report::{
    analyze_events, analyze_events_concurrently, analyze_file, AnalysisSettings, FileAnalysis,
    FileAnalyzer, QualityScore,
};
pub use session::{reconstruct_sessions, SessionReport, SessionStatus, SessionTracker};
pub use stats::{percentile, DurationStats};
