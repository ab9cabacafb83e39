//! `cadence trigger`: Trigger registration and lock administration.

use chrono::{DateTime, Utc};
use serde_json::json;

use cadence_core::models::{Trigger, TriggerFilter, TriggerKey};
use cadence_core::state::AppState;

use super::{describe, to_json};

pub async fn list(state: &AppState, filter: &TriggerFilter) -> Result<serde_json::Value, String> {
    let triggers = state.trigger_locks.list(filter).await.map_err(describe)?;
    Ok(json!({ "triggers": to_json(&triggers)? }))
}

pub async fn register(
    state: &AppState,
    key: TriggerKey,
    next_execution_date: Option<DateTime<Utc>>,
    disabled: bool,
) -> Result<serde_json::Value, String> {
    let mut trigger = Trigger::new(key, next_execution_date);
    trigger.disabled = disabled;
    let saved = state.trigger_locks.register(&trigger).await.map_err(describe)?;
    to_json(&saved)
}

pub async fn unlock(state: &AppState, key: &TriggerKey) -> Result<serde_json::Value, String> {
    let trigger = state.trigger_locks.unlock(key).await.map_err(describe)?;
    to_json(&trigger)
}

pub async fn unlock_all(state: &AppState, filter: &TriggerFilter) -> Result<serde_json::Value, String> {
    let count = state.trigger_locks.unlock_matching(filter).await.map_err(describe)?;
    Ok(json!({ "count": count }))
}

pub async fn restart(state: &AppState, key: &TriggerKey) -> Result<serde_json::Value, String> {
    let trigger = state.trigger_locks.restart(key, Utc::now()).await.map_err(describe)?;
    to_json(&trigger)
}

pub async fn set_disabled(state: &AppState, key: &TriggerKey, disabled: bool) -> Result<serde_json::Value, String> {
    let trigger = state.trigger_locks.set_disabled(key, disabled).await.map_err(describe)?;
    to_json(&trigger)
}

pub async fn set_disabled_all(
    state: &AppState,
    filter: &TriggerFilter,
    disabled: bool,
) -> Result<serde_json::Value, String> {
    let count = state
        .trigger_locks
        .set_disabled_matching(filter, disabled)
        .await
        .map_err(describe)?;
    Ok(json!({ "count": count }))
}

pub async fn delete(state: &AppState, key: &TriggerKey) -> Result<serde_json::Value, String> {
    state.trigger_locks.delete(key).await.map_err(describe)?;
    Ok(json!({ "deleted": key.to_string() }))
}

pub async fn delete_all(state: &AppState, filter: &TriggerFilter) -> Result<serde_json::Value, String> {
    let count = state.trigger_locks.delete_matching(filter).await.map_err(describe)?;
    Ok(json!({ "count": count }))
}
