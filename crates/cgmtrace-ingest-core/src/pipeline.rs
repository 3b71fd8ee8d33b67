use crate::envelope::EnvelopeParser;
use crate::logan::{decode_bytes, LoganCipher};
use crate::model::{EventRecord, FileState, FileStatus, IngestReport};
use crate::store::{EventStore, RawLogSource};
use anyhow::{Context, Result};
use cgmtrace_config::AppConfig;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Everything needed to turn raw files into stored events.
#[derive(Debug, Clone)]
pub struct Ingestor {
    cipher: LoganCipher,
    parser: EnvelopeParser,
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Ingestor {
    pub fn new(cipher: LoganCipher, parser: EnvelopeParser) -> Self {
        Self { cipher, parser }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let cipher = LoganCipher::from_config(&config.decoder)
            .context("invalid logan decoder configuration")?;
        Ok(Self::new(cipher, EnvelopeParser::from_config(&config.ingest)))
    }

    /// Decodes and parses raw bytes without touching storage.
    pub fn parse_bytes(&self, file_id: &str, bytes: &[u8]) -> (IngestReport, Vec<EventRecord>) {
        let decoded = decode_bytes(bytes, &self.cipher);
        if decoded.stats.is_degraded() {
            warn!(
                "{file_id}: {} of {} logan blocks could not be decoded",
                decoded.stats.blocks_failed, decoded.stats.blocks_attempted
            );
        }

        let lines = decoded.lines.len() as u64;
        let batch = self.parser.parse_lines(&decoded.lines);
        let status = batch.status();

        let report = IngestReport {
            file_id: file_id.to_string(),
            fingerprint: fingerprint(bytes),
            container: decoded.container,
            decode: decoded.stats,
            lines,
            records: batch.records.len() as u64,
            parser_errors: batch.parser_errors,
            error_samples: batch.error_samples,
            status,
        };

        (report, batch.records)
    }

    /// Loads, decodes, parses and stores one file.
    ///
    /// Storage is replaced wholesale so re-ingesting is idempotent. A file
    /// whose bytes cannot be loaded is marked failed and the error returned.
    pub async fn ingest_file(
        &self,
        source: &dyn RawLogSource,
        store: &dyn EventStore,
        file_id: &str,
    ) -> Result<IngestReport> {
        let bytes = match source.load(file_id).await {
            Ok(bytes) => bytes,
            Err(exc) => {
                warn!("{file_id}: raw log unavailable: {exc}");
                let state = FileState {
                    status: FileStatus::Failed,
                    records: 0,
                    parser_errors: 0,
                    reason: Some(exc.to_string()),
                    updated_at_ms: now_ms(),
                };
                if let Err(mark_exc) = store.mark_file_status(file_id, state).await {
                    warn!("{file_id}: failed recording load failure: {mark_exc}");
                }
                return Err(exc).with_context(|| format!("failed to load raw log {file_id}"));
            }
        };

        let (report, records) = self.parse_bytes(file_id, &bytes);

        store
            .replace_file_events(file_id, records)
            .await
            .with_context(|| format!("failed to store events for {file_id}"))?;

        store
            .mark_file_status(
                file_id,
                FileState {
                    status: report.status,
                    records: report.records,
                    parser_errors: report.parser_errors,
                    reason: report.error_samples.first().cloned(),
                    updated_at_ms: now_ms(),
                },
            )
            .await
            .with_context(|| format!("failed to mark status for {file_id}"))?;

        info!(
            "{file_id}: {} records ({} parser errors, {} blocks ok / {} failed) status={}",
            report.records,
            report.parser_errors,
            report.decode.blocks_succeeded,
            report.decode.blocks_failed,
            report.status.as_str()
        );

        Ok(report)
    }

    /// Ingests several files with at most `max_workers` in flight.
    ///
    /// One file failing does not affect the others; results come back in
    /// input order.
    pub async fn ingest_batch(
        self: Arc<Self>,
        source: Arc<dyn RawLogSource>,
        store: Arc<dyn EventStore>,
        file_ids: Vec<String>,
        max_workers: usize,
    ) -> Vec<(String, Result<IngestReport>)> {
        let sem = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut handles = Vec::with_capacity(file_ids.len());

        for file_id in file_ids {
            let permit = match sem.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ingestor = self.clone();
            let source = source.clone();
            let store = store.clone();
            let worker_id = file_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                ingestor
                    .ingest_file(source.as_ref(), store.as_ref(), &worker_id)
                    .await
            });
            handles.push((file_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (file_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(exc) => Err(anyhow::anyhow!("ingest worker for {file_id} failed: {exc}")),
            };
            results.push((file_id, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logan::fixtures::{block, Codec, IV, KEY};
    use crate::store::{EventQuery, MemoryEventStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapSource(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl RawLogSource for MapSource {
        async fn load(&self, file_id: &str) -> StoreResult<Vec<u8>> {
            self.0
                .get(file_id)
                .cloned()
                .ok_or_else(|| StoreError::not_found(file_id))
        }
    }

    fn ingestor() -> Ingestor {
        Ingestor::new(LoganCipher::new(KEY, IV), EnvelopeParser::default())
    }

    fn line(name: &str, ts: i64) -> String {
        json!({
            "payload": json!({"eventName": name, "linkCode": "L1"}).to_string(),
            "level": 2,
            "timestampMs": ts,
        })
        .to_string()
    }

    #[tokio::test]
    async fn encrypted_file_round_trips_into_store() {
        let text = format!("{}\n{}\n", line("BLE_SCAN_START", 20), line("BLE_CONNECTED", 10));
        let mut bytes = block(&text, Codec::Gzip);
        bytes.extend(block("garbage that is not json\n", Codec::Zlib));
        let source = MapSource(HashMap::from([("f1".to_string(), bytes)]));
        let store = MemoryEventStore::new();

        let report = ingestor()
            .ingest_file(&source, &store, "f1")
            .await
            .expect("ingest");
        assert!(report.container);
        assert_eq!(report.decode.blocks_succeeded, 2);
        assert_eq!(report.lines, 3);
        assert_eq!(report.records, 3);
        assert_eq!(report.parser_errors, 1);
        assert_eq!(report.status, FileStatus::Failed);

        let state = store.file_state("f1").await.expect("state").expect("present");
        assert_eq!(state.status, FileStatus::Failed);
        assert_eq!(state.records, 3);

        let events = store
            .load_events("f1", &EventQuery::for_session("L1"))
            .await
            .expect("events");
        let names: Vec<&str> = events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(names, vec!["BLE_CONNECTED", "BLE_SCAN_START"]);
    }

    #[tokio::test]
    async fn reingest_replaces_previous_events() {
        let store = MemoryEventStore::new();
        let first = MapSource(HashMap::from([(
            "f".to_string(),
            format!("{}\n{}\n", line("A", 1), line("B", 2)).into_bytes(),
        )]));
        ingestor().ingest_file(&first, &store, "f").await.expect("first");

        let second = MapSource(HashMap::from([(
            "f".to_string(),
            format!("{}\n", line("C", 3)).into_bytes(),
        )]));
        let report = ingestor().ingest_file(&second, &store, "f").await.expect("second");
        assert_eq!(report.status, FileStatus::Parsed);
        assert!(!report.container);

        let freq = store.event_frequencies("f").await.expect("freq");
        assert_eq!(freq.keys().cloned().collect::<Vec<_>>(), vec!["C".to_string()]);
    }

    #[tokio::test]
    async fn batch_isolates_failures_and_keeps_order() {
        let source: Arc<dyn RawLogSource> = Arc::new(MapSource(HashMap::from([
            ("a".to_string(), format!("{}\n", line("A", 1)).into_bytes()),
            ("c".to_string(), format!("{}\n", line("C", 3)).into_bytes()),
        ])));
        let store = Arc::new(MemoryEventStore::new());
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let results = Arc::new(ingestor())
            .ingest_batch(source, store.clone(), ids, 2)
            .await;
        let order: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert!(results[2].1.is_ok());

        let state = store.file_state("b").await.expect("state").expect("present");
        assert_eq!(state.status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn missing_source_marks_file_failed() {
        let store = MemoryEventStore::new();
        let source = MapSource(HashMap::new());
        let err = ingestor()
            .ingest_file(&source, &store, "gone")
            .await
            .expect_err("missing bytes are fatal");
        assert!(format!("{err:#}").contains("failed to load raw log gone"));

        let state = store.file_state("gone").await.expect("state").expect("present");
        assert_eq!(state.status, FileStatus::Failed);
        assert!(state.reason.unwrap_or_default().contains("not found"));
    }
}
