//! Integration tests for the cadence-cli commands.
//!
//! These tests verify that the CLI commands work correctly by
//! exercising the same code paths as the binary, using in-memory
//! SQLite databases for isolation, and an on-disk database shared by
//! two states to stand in for two processes.

use std::sync::Arc;

use cadence_cli::commands::{concurrency, execution, scheduler, trigger};
use cadence_core::models::{FlowKey, TriggerFilter, TriggerKey};
use cadence_core::state::{AppState, AppStateInner};
use cadence_core::{CoordinatorConfig, Database};
use chrono::{Duration, Utc};

/// Create an in-memory AppState for testing.
fn test_state() -> AppState {
    let db = Database::open_in_memory().expect("Failed to open in-memory database");
    Arc::new(AppStateInner::new(db))
}

fn flow() -> FlowKey {
    FlowKey::new("main", "company.team", "etl")
}

fn trigger_key(id: &str) -> TriggerKey {
    TriggerKey::new(flow(), id)
}

#[tokio::test]
async fn test_trigger_register_fire_and_unlock() {
    let state = test_state();

    let registered = trigger::register(&state, trigger_key("hourly"), Some(Utc::now()), false)
        .await
        .unwrap();
    assert_eq!(registered["triggerId"], "hourly");
    assert_eq!(registered["lock"]["status"], "UNLOCKED");

    let fired = execution::fire(&state, &trigger_key("hourly")).await.unwrap();
    assert_eq!(fired["outcome"], "STARTED");
    let execution_id = fired["id"].as_str().expect("Expected execution id").to_string();
    assert_eq!(fired["trigger"]["triggerId"], "hourly");

    let again = execution::fire(&state, &trigger_key("hourly")).await.unwrap();
    assert_eq!(again["outcome"], "SKIPPED");
    assert_eq!(again["reason"], "ALREADY_LOCKED");

    let listed = trigger::list(
        &state,
        &TriggerFilter {
            locked: Some(true),
            ..TriggerFilter::tenant("main")
        },
    )
    .await
    .unwrap();
    let triggers = listed["triggers"].as_array().unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0]["lock"]["status"], "LOCKED_BY");
    assert_eq!(triggers[0]["lock"]["executionId"], execution_id.as_str());

    let unlocked = trigger::unlock(&state, &trigger_key("hourly")).await.unwrap();
    assert_eq!(unlocked["lock"]["status"], "UNLOCKED");

    let err = trigger::unlock(&state, &trigger_key("hourly")).await.unwrap_err();
    assert!(err.contains("not locked"), "unexpected error: {}", err);
    assert!(err.contains("Conflict"), "unexpected error: {}", err);

    let err = trigger::unlock(&state, &trigger_key("missing")).await.unwrap_err();
    assert!(err.contains("NotFound"), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_trigger_bulk_commands() {
    let state = test_state();
    for id in ["a", "b", "c"] {
        trigger::register(&state, trigger_key(id), Some(Utc::now()), false)
            .await
            .unwrap();
    }
    trigger::register(
        &state,
        TriggerKey::new(FlowKey::new("main", "elsewhere", "etl"), "d"),
        None,
        false,
    )
    .await
    .unwrap();

    let filter = TriggerFilter {
        namespace: Some("company".to_string()),
        ..TriggerFilter::tenant("main")
    };
    let result = trigger::set_disabled_all(&state, &filter, true).await.unwrap();
    assert_eq!(result["count"], 3);

    let disabled = trigger::set_disabled(&state, &trigger_key("a"), false).await.unwrap();
    assert_eq!(disabled["disabled"], false);

    let fired = execution::fire(&state, &trigger_key("b")).await.unwrap();
    assert_eq!(fired["reason"], "DISABLED");

    let result = trigger::unlock_all(&state, &TriggerFilter::tenant("main")).await.unwrap();
    assert_eq!(result["count"], 0);

    let result = trigger::delete_all(&state, &filter).await.unwrap();
    assert_eq!(result["count"], 3);
    let remaining = trigger::list(&state, &TriggerFilter::tenant("main")).await.unwrap();
    assert_eq!(remaining["triggers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrency_limit_commands() {
    let state = test_state();

    let configured = concurrency::configure(&state, &flow(), 1).await.unwrap();
    assert_eq!(configured["limit"], 1);
    assert_eq!(configured["running"], 0);

    let a = execution::submit(&state, &flow(), 1, &[]).await.unwrap();
    assert_eq!(a["state"]["current"], "RUNNING");
    let b = execution::submit(&state, &flow(), 1, &["team=data".to_string()])
        .await
        .unwrap();
    assert_eq!(b["state"]["current"], "QUEUED");
    assert_eq!(b["labels"]["team"], "data");

    let shown = concurrency::get(&state, &flow()).await.unwrap();
    assert_eq!(shown["limit"]["running"], 1);
    assert_eq!(shown["queued"][0], b["id"]);

    let listed = concurrency::list(&state, "main").await.unwrap();
    assert_eq!(listed["limits"].as_array().unwrap().len(), 1);

    // Terminating A hands its slot to B.
    let a_id = a["id"].as_str().unwrap();
    let done = execution::transition(&state, a_id, "success").await.unwrap();
    assert_eq!(done["state"]["current"], "SUCCESS");

    let b_now = execution::get(&state, b["id"].as_str().unwrap()).await.unwrap();
    assert_eq!(b_now["state"]["current"], "RUNNING");
    let shown = concurrency::get(&state, &flow()).await.unwrap();
    assert_eq!(shown["limit"]["running"], 1);
    assert!(shown["queued"].as_array().unwrap().is_empty());

    let repaired = concurrency::set(&state, &flow(), 4, 0).await.unwrap();
    assert_eq!(repaired["limit"], 4);
    assert_eq!(repaired["running"], 0);

    concurrency::delete(&state, &flow()).await.unwrap();
    let err = concurrency::get(&state, &flow()).await.unwrap_err();
    assert!(err.contains("NotFound"), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_raising_a_limit_starts_queued_executions() {
    let state = test_state();
    concurrency::configure(&state, &flow(), 1).await.unwrap();

    let a = execution::submit(&state, &flow(), 1, &[]).await.unwrap();
    for _ in 0..4 {
        let queued = execution::submit(&state, &flow(), 1, &[]).await.unwrap();
        assert_eq!(queued["state"]["current"], "QUEUED");
    }

    let raised = concurrency::configure(&state, &flow(), 3).await.unwrap();
    assert_eq!(raised["running"], 3);

    execution::transition(&state, a["id"].as_str().unwrap(), "SUCCESS")
        .await
        .unwrap();
    let shown = concurrency::get(&state, &flow()).await.unwrap();
    assert_eq!(shown["limit"]["running"], 3);
    assert_eq!(shown["queued"].as_array().unwrap().len(), 1);

    let running = execution::list(&state, "main", None, None, Some("RUNNING"), "createdAt", "asc")
        .await
        .unwrap();
    assert_eq!(running["executions"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_execution_unqueue_and_list() {
    let state = test_state();
    concurrency::configure(&state, &flow(), 1).await.unwrap();

    let running = execution::submit(&state, &flow(), 1, &[]).await.unwrap();
    let queued = execution::submit(&state, &flow(), 1, &[]).await.unwrap();
    let queued_id = queued["id"].as_str().unwrap();

    let err = execution::unqueue(&state, queued_id, "SUCCESS").await.unwrap_err();
    assert!(err.contains("BadRequest"), "unexpected error: {}", err);
    let err = execution::unqueue(&state, running["id"].as_str().unwrap(), "CANCELLED")
        .await
        .unwrap_err();
    assert!(err.contains("not queued"), "unexpected error: {}", err);

    let still = execution::unqueue(&state, queued_id, "RUNNING").await.unwrap();
    assert_eq!(still["state"]["current"], "QUEUED");

    let cancelled = execution::unqueue(&state, queued_id, "CANCELLED").await.unwrap();
    assert_eq!(cancelled["state"]["current"], "CANCELLED");

    let listed = execution::list(&state, "main", None, None, None, "duration", "asc")
        .await
        .unwrap();
    let rows = listed["executions"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["state"], "RUNNING");
    assert!(rows[0]["durationMs"].is_null());
    assert_eq!(rows[1]["state"], "CANCELLED");
    assert!(rows[1]["durationMs"].is_number());

    let only_cancelled = execution::list(&state, "main", None, None, Some("cancelled"), "createdAt", "desc")
        .await
        .unwrap();
    assert_eq!(only_cancelled["executions"].as_array().unwrap().len(), 1);

    assert!(execution::list(&state, "main", None, None, None, "size", "asc").await.is_err());
    assert!(execution::transition(&state, "missing", "RUNNING").await.is_err());
}

#[tokio::test]
async fn test_scheduler_tick_fires_due_triggers() {
    let state = test_state();
    trigger::register(&state, trigger_key("due"), Some(Utc::now() - Duration::minutes(1)), false)
        .await
        .unwrap();
    trigger::register(&state, trigger_key("future"), Some(Utc::now() + Duration::hours(1)), false)
        .await
        .unwrap();

    let ticked = scheduler::tick(&state).await.unwrap();
    let fired = ticked["fired"].as_array().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0]["trigger"]["triggerId"], "due");

    let ticked = scheduler::tick(&state).await.unwrap();
    assert!(ticked["fired"].as_array().unwrap().is_empty());

    let restarted = trigger::restart(&state, &trigger_key("due")).await.unwrap();
    assert_eq!(restarted["lock"]["status"], "UNLOCKED");
    let ticked = scheduler::tick(&state).await.unwrap();
    assert_eq!(ticked["fired"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_two_processes_share_admission_and_locks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let path = path.to_str().unwrap();

    let open = |worker: &str| -> AppState {
        let config = CoordinatorConfig {
            worker_id: worker.to_string(),
            ..Default::default()
        };
        Arc::new(AppStateInner::with_config(Database::open(path).unwrap(), config))
    };
    let first = open("worker-1");
    let second = open("worker-2");

    concurrency::configure(&first, &flow(), 2).await.unwrap();
    trigger::register(&first, trigger_key("T"), Some(Utc::now()), false)
        .await
        .unwrap();

    // Both "processes" race for the same trigger: one winner.
    let (key_a, key_b) = (trigger_key("T"), trigger_key("T"));
    let (a, b) = tokio::join!(
        execution::fire(&first, &key_a),
        execution::fire(&second, &key_b)
    );
    let outcomes = [a.unwrap()["outcome"].clone(), b.unwrap()["outcome"].clone()];
    assert_eq!(outcomes.iter().filter(|o| *o == "STARTED").count(), 1);
    assert_eq!(outcomes.iter().filter(|o| *o == "SKIPPED").count(), 1);

    // Admission across both never exceeds the limit.
    let mut handles = Vec::new();
    for i in 0..6 {
        let state = if i % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            execution::submit(&state, &flow(), 1, &[]).await.unwrap()
        }));
    }
    let mut started = 0;
    for handle in handles {
        if handle.await.unwrap()["state"]["current"] == "RUNNING" {
            started += 1;
        }
    }
    assert_eq!(started, 1);

    let shown = concurrency::get(&second, &flow()).await.unwrap();
    assert_eq!(shown["limit"]["running"], 2);
    assert_eq!(shown["queued"].as_array().unwrap().len(), 5);
}
