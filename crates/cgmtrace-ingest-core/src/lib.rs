mod coordinator;
pub mod envelope;
pub mod logan;
pub mod model;
pub mod payload;
mod pipeline;
pub mod store;

pub use coordinator::{FileRunCoordinator, RunOutcome};
pub use envelope::{parse_line, EnvelopeError, EnvelopeParser};
pub use logan::{decode_bytes, decode_container, is_logan_container, DecodedLog, LoganCipher};
pub use model::{
    DecodeStats, EventRecord, FileState, FileStatus, IngestReport, ParsedBatch, Payload,
    PARSER_ERROR_EVENT,
};
pub use pipeline::Ingestor;
pub use store::{
    EventQuery, EventStore, FsLogSource, MemoryEventStore, RawLogSource, StoreError, StoreResult,
};
