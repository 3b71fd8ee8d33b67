use crate::model::{EventRecord, FileState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Page selector for [`EventStore::load_events`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub session_key: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_session(session_key: impl Into<String>) -> Self {
        Self {
            session_key: Some(session_key.into()),
            ..Self::default()
        }
    }

    fn matches(&self, record: &EventRecord) -> bool {
        if let Some(key) = &self.session_key {
            if record.session_key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if record.timestamp_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if record.timestamp_ms > to {
                return false;
            }
        }
        true
    }
}

/// Source of raw log bytes, e.g. an object store.
#[async_trait]
pub trait RawLogSource: Send + Sync {
    async fn load(&self, file_id: &str) -> StoreResult<Vec<u8>>;
}

/// Persistence boundary for parsed events.
///
/// Implementations must return events stable-sorted by
/// `(timestamp_ms, record_id)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Clears any events previously stored for the file, then stores `records`.
    async fn replace_file_events(&self, file_id: &str, records: Vec<EventRecord>)
        -> StoreResult<()>;

    async fn mark_file_status(&self, file_id: &str, state: FileState) -> StoreResult<()>;

    async fn file_state(&self, file_id: &str) -> StoreResult<Option<FileState>>;

    async fn load_events(&self, file_id: &str, query: &EventQuery)
        -> StoreResult<Vec<EventRecord>>;

    async fn event_frequencies(&self, file_id: &str) -> StoreResult<BTreeMap<String, u64>>;
}

#[derive(Debug, Default)]
struct StoredFile {
    events: Vec<EventRecord>,
    state: Option<FileState>,
}

/// In-process [`EventStore`].
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    files: RwLock<HashMap<String, StoredFile>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn replace_file_events(
        &self,
        file_id: &str,
        mut records: Vec<EventRecord>,
    ) -> StoreResult<()> {
        records.sort_by_key(EventRecord::order_key);
        let mut files = self.files.write().await;
        files.entry(file_id.to_string()).or_default().events = records;
        Ok(())
    }

    async fn mark_file_status(&self, file_id: &str, state: FileState) -> StoreResult<()> {
        let mut files = self.files.write().await;
        files.entry(file_id.to_string()).or_default().state = Some(state);
        Ok(())
    }

    async fn file_state(&self, file_id: &str) -> StoreResult<Option<FileState>> {
        let files = self.files.read().await;
        Ok(files.get(file_id).and_then(|file| file.state.clone()))
    }

    async fn load_events(
        &self,
        file_id: &str,
        query: &EventQuery,
    ) -> StoreResult<Vec<EventRecord>> {
        let files = self.files.read().await;
        let Some(file) = files.get(file_id) else {
            return Ok(Vec::new());
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(file
            .events
            .iter()
            .filter(|record| query.matches(record))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn event_frequencies(&self, file_id: &str) -> StoreResult<BTreeMap<String, u64>> {
        let files = self.files.read().await;
        let mut freq = BTreeMap::<String, u64>::new();
        if let Some(file) = files.get(file_id) {
            for record in &file.events {
                *freq.entry(record.event_name.clone()).or_insert(0) += 1;
            }
        }
        Ok(freq)
    }
}

/// Reads raw logs from files below a root directory.
#[derive(Debug, Clone)]
pub struct FsLogSource {
    root: PathBuf,
}

impl FsLogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file_id: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(file_id);
        let safe = !file_id.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StoreError::invalid_argument(format!(
                "file id `{file_id}` must be a relative path without `..`"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RawLogSource for FsLogSource {
    async fn load(&self, file_id: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(file_id)?;
        tokio::fs::read(&path).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                StoreError::not_found(path.display().to_string())
            } else {
                StoreError::backend(format!("failed to read {}: {error}", path.display()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStatus, LEVEL_INFO};

    fn record(id: u64, ts: i64, name: &str, session: &str) -> EventRecord {
        EventRecord::new(id, ts, LEVEL_INFO, name).with_session(session)
    }

    #[tokio::test]
    async fn replace_clears_previous_events_and_sorts() {
        let store = MemoryEventStore::new();
        store
            .replace_file_events("f", vec![record(1, 10, "OLD", "s")])
            .await
            .expect("insert");
        store
            .replace_file_events(
                "f",
                vec![record(2, 30, "B", "s"), record(1, 30, "A", "s"), record(3, 5, "C", "t")],
            )
            .await
            .expect("replace");

        let events = store
            .load_events("f", &EventQuery::default())
            .await
            .expect("load");
        let names: Vec<&str> = events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);

        let freq = store.event_frequencies("f").await.expect("freq");
        assert!(!freq.contains_key("OLD"));
        assert_eq!(freq.get("A"), Some(&1));
    }

    #[tokio::test]
    async fn query_filters_session_window_and_limit() {
        let store = MemoryEventStore::new();
        store
            .replace_file_events(
                "f",
                vec![
                    record(1, 10, "A", "s1"),
                    record(2, 20, "B", "s2"),
                    record(3, 30, "C", "s1"),
                    record(4, 40, "D", "s1"),
                ],
            )
            .await
            .expect("insert");

        let only_s1 = store
            .load_events("f", &EventQuery::for_session("s1"))
            .await
            .expect("load");
        assert_eq!(only_s1.len(), 3);

        let window = EventQuery {
            from_ms: Some(15),
            to_ms: Some(35),
            limit: Some(1),
            ..EventQuery::default()
        };
        let page = store.load_events("f", &window).await.expect("load");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].event_name, "B");

        assert!(store
            .load_events("missing", &EventQuery::default())
            .await
            .expect("load")
            .is_empty());
    }

    #[tokio::test]
    async fn status_round_trips() {
        let store = MemoryEventStore::new();
        assert!(store.file_state("f").await.expect("state").is_none());
        store
            .mark_file_status(
                "f",
                FileState {
                    status: FileStatus::Failed,
                    records: 0,
                    parser_errors: 0,
                    reason: Some("missing".to_string()),
                    updated_at_ms: 1,
                },
            )
            .await
            .expect("mark");
        let state = store.file_state("f").await.expect("state").expect("present");
        assert_eq!(state.status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn fs_source_rejects_traversal_and_reports_missing() {
        let source = FsLogSource::new(std::env::temp_dir());
        assert!(matches!(
            source.load("../etc/passwd").await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            source.load("cgmtrace-definitely-missing-log.bin").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
