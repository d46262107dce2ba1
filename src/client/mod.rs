//! Upload client
//!
//! Fingerprints a local file, negotiates a session, sends the missing
//! chunks with bounded concurrency and retries, then finalizes. Resume
//! state and a history of finished uploads are kept in a local
//! [`KeyValueStore`].

pub mod fingerprint;
pub mod local_store;
pub mod orchestrator;
pub mod progress;
pub mod transport;

pub use fingerprint::{fingerprint_bytes, fingerprint_file};
pub use local_store::{
    HistoryEntry, HistoryLog, HistoryStatus, JsonFileStore, KeyValueStore, MemoryStore,
    ResumePointers, ResumptionPointer, StoreError,
};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorError, UploadControl, UploadOrchestrator, UploadOutcome,
};
pub use progress::{ProgressCallback, ProgressSnapshot, ProgressTracker};
pub use transport::{
    FaultyTransport, HttpTransport, InProcessTransport, TransportError, UploadTransport,
};
