//! `cadence scheduler`: Evaluate due triggers.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use cadence_core::state::AppState;

use super::{describe, to_json};

/// Fire every due trigger once.
pub async fn tick(state: &AppState) -> Result<serde_json::Value, String> {
    let outcomes = state.scheduler.tick(Utc::now()).await.map_err(describe)?;
    Ok(json!({ "fired": to_json(&outcomes)? }))
}

/// Run the scheduler loop and the terminal-event consumer until Ctrl-C.
pub async fn run(state: &AppState, interval_secs: u64) -> Result<serde_json::Value, String> {
    let consumer = {
        let coordinator = state.coordinator.clone();
        let receiver = state.event_bus.subscribe();
        tokio::spawn(async move { coordinator.run(receiver).await })
    };

    state
        .scheduler
        .run_until(Duration::from_secs(interval_secs.max(1)), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("[Scheduler] Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await;

    consumer.abort();
    Ok(json!({ "status": "stopped" }))
}
