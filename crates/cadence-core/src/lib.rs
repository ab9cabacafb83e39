//! Cadence Core: execution lifecycle, admission control and trigger locking.
//!
//! This crate contains the state model of executions, the per-flow concurrency
//! admission controller, the trigger lock manager and the coordinator tying
//! them together. All cross-process coordination goes through conditional
//! writes on a shared SQLite database, so any number of scheduler and worker
//! processes can run against the same file.
//!
//! It has **no HTTP framework dependency** by default.
//!
//! # Feature Flags
//!
//! - `axum`: Enables `IntoResponse` impl on `OrchestrationError` for use in axum handlers.

pub mod concurrency;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestration;
pub mod state;
pub mod store;
pub mod triggers;

// Convenience re-exports
pub use concurrency::ConcurrencyLimitService;
pub use db::Database;
pub use error::OrchestrationError;
pub use orchestration::{Coordinator, CoordinatorConfig, FireOutcome, Scheduler};
pub use state::{AppState, AppStateInner};
pub use triggers::TriggerLockManager;
