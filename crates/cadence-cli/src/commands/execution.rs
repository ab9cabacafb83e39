//! `cadence execution`: Execution lifecycle commands.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;

use cadence_core::models::{ExecutionRequest, FlowKey, SortOrder, StateType, TriggerKey};
use cadence_core::state::AppState;
use cadence_core::store::{ExecutionQuery, ExecutionSort};

use super::{describe, to_json};

pub async fn get(state: &AppState, execution_id: &str) -> Result<serde_json::Value, String> {
    let execution = state.coordinator.get_execution(execution_id).await.map_err(describe)?;
    to_json(&execution)
}

pub async fn list(
    state: &AppState,
    tenant_id: &str,
    namespace: Option<String>,
    flow_id: Option<String>,
    status: Option<&str>,
    sort: &str,
    order: &str,
) -> Result<serde_json::Value, String> {
    let query = ExecutionQuery {
        tenant_id: tenant_id.to_string(),
        namespace,
        flow_id,
        state: status.map(parse_state).transpose()?,
        sort: ExecutionSort::from_str(sort).ok_or_else(|| format!("Unknown sort field: {}", sort))?,
        order: SortOrder::from_str(order).ok_or_else(|| format!("Unknown sort order: {}", order))?,
    };
    let executions = state.executions.list(&query).await.map_err(describe)?;

    let rows: Vec<serde_json::Value> = executions
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "namespace": e.namespace,
                "flowId": e.flow_id,
                "state": e.state.current(),
                "startDate": e.state.start_date(),
                "endDate": e.state.end_date(),
                "durationMs": e.state.duration().map(|d| d.num_milliseconds()),
            })
        })
        .collect();
    Ok(json!({ "executions": rows }))
}

pub async fn submit(
    state: &AppState,
    flow: &FlowKey,
    flow_revision: u32,
    labels: &[String],
) -> Result<serde_json::Value, String> {
    let request = ExecutionRequest {
        flow_revision,
        labels: parse_labels(labels)?,
    };
    let execution = state
        .coordinator
        .submit(flow, request, Utc::now())
        .await
        .map_err(describe)?;
    to_json(&execution)
}

pub async fn fire(state: &AppState, key: &TriggerKey) -> Result<serde_json::Value, String> {
    let outcome = state
        .coordinator
        .fire_trigger(key, ExecutionRequest::default(), Utc::now())
        .await
        .map_err(describe)?;
    to_json(&outcome)
}

pub async fn transition(state: &AppState, execution_id: &str, to: &str) -> Result<serde_json::Value, String> {
    let execution = state
        .coordinator
        .transition(execution_id, parse_state(to)?, Utc::now())
        .await
        .map_err(describe)?;
    to_json(&execution)
}

pub async fn unqueue(state: &AppState, execution_id: &str, to: &str) -> Result<serde_json::Value, String> {
    let execution = state
        .coordinator
        .unqueue(execution_id, parse_state(to)?)
        .await
        .map_err(describe)?;
    to_json(&execution)
}

fn parse_state(s: &str) -> Result<StateType, String> {
    StateType::from_str(s).ok_or_else(|| format!("Unknown state: {}", s))
}

fn parse_labels(labels: &[String]) -> Result<BTreeMap<String, String>, String> {
    labels
        .iter()
        .map(|label| match label.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(format!("Invalid label '{}', expected key=value", label)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["team=data".to_string(), "env=".to_string()]).unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("data"));
        assert_eq!(labels.get("env").map(String::as_str), Some(""));
        assert!(parse_labels(&["broken".to_string()]).is_err());
        assert!(parse_labels(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_state_is_case_insensitive() {
        assert_eq!(parse_state("running").unwrap(), StateType::Running);
        assert!(parse_state("done").is_err());
    }
}
