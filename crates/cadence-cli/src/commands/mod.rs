//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the cadence-core services through `AppState`. Commands return the JSON
//! value to print; `main` does the printing.

pub mod concurrency;
pub mod execution;
pub mod scheduler;
pub mod trigger;

use std::sync::Arc;

use cadence_core::models::{FlowKey, TriggerFilter, TriggerKey};
use cadence_core::state::AppState;
use cadence_core::{CoordinatorConfig, OrchestrationError};
use clap::Args;
use serde::Serialize;

/// Initialize a shared `AppState` from the given SQLite database path.
pub fn init_state(db_path: &str, worker_id: &str) -> AppState {
    let db = cadence_core::Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    });

    let config = CoordinatorConfig {
        worker_id: worker_id.to_string(),
        ..Default::default()
    };
    Arc::new(cadence_core::AppStateInner::with_config(db, config))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialize a command result for printing.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialize result: {}", e))
}

pub(crate) fn describe(err: OrchestrationError) -> String {
    format!("{} ({:?})", err, err.status())
}

/// Flow selection shared by several commands.
#[derive(Args, Debug, Clone)]
pub struct FlowArgs {
    /// Tenant ID
    #[arg(long, env = "CADENCE_TENANT", default_value = "main")]
    pub tenant: String,
    /// Namespace of the flow (e.g. "company.team")
    #[arg(long)]
    pub namespace: String,
    /// Flow ID
    #[arg(long)]
    pub flow: String,
}

impl FlowArgs {
    pub fn key(&self) -> FlowKey {
        FlowKey::new(&self.tenant, &self.namespace, &self.flow)
    }
}

/// Trigger selection.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    #[command(flatten)]
    pub flow: FlowArgs,
    /// Trigger ID
    #[arg(long)]
    pub trigger: String,
}

impl TriggerArgs {
    pub fn key(&self) -> TriggerKey {
        TriggerKey::new(self.flow.key(), &self.trigger)
    }
}

/// Filter for bulk trigger operations.
#[derive(Args, Debug, Clone)]
pub struct TriggerFilterArgs {
    /// Tenant ID
    #[arg(long, env = "CADENCE_TENANT", default_value = "main")]
    pub tenant: String,
    /// Namespace; child namespaces match too
    #[arg(long)]
    pub namespace: Option<String>,
    /// Flow ID
    #[arg(long)]
    pub flow: Option<String>,
    /// Only locked (true) or unlocked (false) triggers
    #[arg(long)]
    pub locked: Option<bool>,
    /// Only disabled (true) or enabled (false) triggers
    #[arg(long)]
    pub disabled: Option<bool>,
}

impl TriggerFilterArgs {
    pub fn filter(&self) -> TriggerFilter {
        TriggerFilter {
            tenant_id: self.tenant.clone(),
            namespace: self.namespace.clone(),
            flow_id: self.flow.clone(),
            locked: self.locked,
            disabled: self.disabled,
        }
    }
}
