//! `cadence concurrency`: Per-flow concurrency limits.

use serde_json::json;

use cadence_core::models::{ConcurrencyLimit, FlowKey};
use cadence_core::state::AppState;

use super::{describe, to_json};

pub async fn list(state: &AppState, tenant_id: &str) -> Result<serde_json::Value, String> {
    let limits = state.admission.find(tenant_id).await.map_err(describe)?;
    Ok(json!({ "limits": to_json(&limits)? }))
}

/// Show a limit together with the flow's current queue.
pub async fn get(state: &AppState, flow: &FlowKey) -> Result<serde_json::Value, String> {
    let limit = state.admission.find_by_id(flow).await.map_err(describe)?;
    let queued: Vec<String> = state
        .admission
        .queued(flow)
        .await
        .map_err(describe)?
        .into_iter()
        .map(|e| e.id)
        .collect();
    Ok(json!({ "limit": to_json(&limit)?, "queued": queued }))
}

/// Operator override of both `limit` and `running`. Queued executions are
/// promoted into any capacity this frees.
pub async fn set(state: &AppState, flow: &FlowKey, limit: u32, running: u32) -> Result<serde_json::Value, String> {
    let record = ConcurrencyLimit {
        running,
        ..ConcurrencyLimit::new(flow, limit)
    };
    let saved = state.coordinator.update_limit(&record).await.map_err(describe)?;
    to_json(&saved)
}

/// Set the limit, promoting queued executions if it was raised.
pub async fn configure(state: &AppState, flow: &FlowKey, limit: u32) -> Result<serde_json::Value, String> {
    let saved = state.coordinator.configure_limit(flow, limit).await.map_err(describe)?;
    to_json(&saved)
}

pub async fn delete(state: &AppState, flow: &FlowKey) -> Result<serde_json::Value, String> {
    state.admission.delete(flow).await.map_err(describe)?;
    Ok(json!({ "deleted": flow.to_string() }))
}
