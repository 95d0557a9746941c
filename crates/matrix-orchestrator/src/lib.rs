//! Orchestrator Facade and process wiring (spec §4.9).

pub mod facade;
pub mod supervisor;
pub mod wiring;

pub use facade::{MatrixOrchestrator, OrchestratorError, SubmitHints, SystemStatus};
pub use wiring::build_orchestrator;
