//! Upload Worker pool and Recovery Engine (spec §4.6, §4.8).

pub mod processor;
pub mod recovery;
pub mod worker;

pub use processor::{NoopProgressReporter, ProgressReporter, UploadPerformer};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use worker::{Worker, WorkerConfig, WorkerPool, WorkerStats, WorkerStatsSnapshot};
