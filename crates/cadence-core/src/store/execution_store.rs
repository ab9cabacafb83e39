use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{ms_to_dt, opt_ms_to_dt};
use crate::db::Database;
use crate::error::OrchestrationError;
use crate::models::execution::{Execution, ExecutionTrigger};
use crate::models::flow::FlowKey;
use crate::models::state::{SortOrder, State, StateHistory, StateType};

const EXECUTION_COLUMNS: &str = "id, tenant_id, namespace, flow_id, flow_revision, labels, trigger_id, \
     trigger_date, state_histories, holds_slot, version";

/// Sort field for execution listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionSort {
    #[default]
    CreatedAt,
    Duration,
}

impl ExecutionSort {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "createdAt" | "created_at" | "created" => Some(Self::CreatedAt),
            "duration" => Some(Self::Duration),
            _ => None,
        }
    }

    fn order_by(&self, order: SortOrder) -> &'static str {
        // Duration sorts on an explicit (terminal, duration) key: rows without
        // a duration are always the smallest.
        match (self, order) {
            (Self::CreatedAt, SortOrder::Asc) => "created_at ASC, id ASC",
            (Self::CreatedAt, SortOrder::Desc) => "created_at DESC, id DESC",
            (Self::Duration, SortOrder::Asc) => {
                "(duration_ms IS NOT NULL) ASC, duration_ms ASC, created_at ASC, id ASC"
            }
            (Self::Duration, SortOrder::Desc) => {
                "(duration_ms IS NOT NULL) DESC, duration_ms DESC, created_at DESC, id DESC"
            }
        }
    }
}

/// Listing query over executions of one tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQuery {
    pub tenant_id: String,
    pub namespace: Option<String>,
    pub flow_id: Option<String>,
    pub state: Option<StateType>,
    #[serde(default)]
    pub sort: ExecutionSort,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new execution.
    pub async fn save(&self, execution: &Execution) -> Result<(), OrchestrationError> {
        let e = execution.clone();
        let histories = serde_json::to_string(e.state.histories())
            .map_err(|err| OrchestrationError::Internal(err.to_string()))?;
        let labels = serde_json::to_string(&e.labels).unwrap_or_else(|_| "{}".to_string());
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, tenant_id, namespace, flow_id, flow_revision, labels,
                     trigger_id, trigger_date, state_current, state_histories, created_at, end_date,
                     duration_ms, holds_slot, version, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    rusqlite::params![
                        e.id,
                        e.tenant_id,
                        e.namespace,
                        e.flow_id,
                        e.flow_revision,
                        labels,
                        e.trigger.as_ref().map(|t| t.trigger_id.clone()),
                        e.trigger.as_ref().map(|t| t.date.timestamp_millis()),
                        e.state.current().as_str(),
                        histories,
                        e.created_at().timestamp_millis(),
                        e.state.end_date().map(|d| d.timestamp_millis()),
                        e.state.duration().map(|d| d.num_milliseconds()),
                        e.holds_concurrency_slot as i64,
                        e.version,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Execution>, OrchestrationError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                    rusqlite::params![id],
                    row_to_execution,
                )
                .optional()
            })
            .await
    }

    /// Persist the state (and slot ownership) of an execution, provided nobody
    /// else updated it since it was read.
    ///
    /// Returns the execution with its new version. A stale version yields
    /// `Conflict`, an unknown id `NotFound`.
    pub async fn update(&self, execution: &Execution) -> Result<Execution, OrchestrationError> {
        let e = execution.clone();
        let histories = serde_json::to_string(e.state.histories())
            .map_err(|err| OrchestrationError::Internal(err.to_string()))?;
        let id = e.id.clone();
        let expected_version = e.version;
        let (updated, exists) = self
            .db
            .with_conn_async(move |conn| {
                let updated = conn.execute(
                    "UPDATE executions SET state_current = ?3, state_histories = ?4, end_date = ?5,
                     duration_ms = ?6, holds_slot = ?7, version = version + 1, updated_at = ?8
                     WHERE id = ?1 AND version = ?2",
                    rusqlite::params![
                        id,
                        expected_version,
                        e.state.current().as_str(),
                        histories,
                        e.state.end_date().map(|d| d.timestamp_millis()),
                        e.state.duration().map(|d| d.num_milliseconds()),
                        e.holds_concurrency_slot as i64,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                let exists = updated > 0
                    || conn
                        .query_row("SELECT 1 FROM executions WHERE id = ?1", rusqlite::params![id], |_| Ok(()))
                        .optional()?
                        .is_some();
                Ok((updated, exists))
            })
            .await?;

        if updated == 0 {
            return Err(if exists {
                OrchestrationError::Conflict(format!(
                    "Execution {} was modified concurrently (expected version {})",
                    execution.id, expected_version
                ))
            } else {
                OrchestrationError::NotFound(format!("Execution {} not found", execution.id))
            });
        }

        let mut saved = execution.clone();
        saved.version += 1;
        Ok(saved)
    }

    /// Give up the concurrency slot held by an execution.
    ///
    /// Returns `true` only for the caller that actually flipped the flag, so
    /// duplicate terminal notifications release the slot once.
    pub async fn release_slot(&self, id: &str) -> Result<bool, OrchestrationError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE executions SET holds_slot = 0, updated_at = ?2 WHERE id = ?1 AND holds_slot = 1",
                    rusqlite::params![id, Utc::now().timestamp_millis()],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// The queue of a flow, in promotion order.
    pub async fn list_queued(
        &self,
        flow: &FlowKey,
        limit: Option<u32>,
    ) -> Result<Vec<Execution>, OrchestrationError> {
        let flow = flow.clone();
        let limit = limit.map(i64::from).unwrap_or(-1);
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions
                     WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND state_current = 'QUEUED'
                     ORDER BY created_at ASC, id ASC LIMIT ?4",
                    EXECUTION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![flow.tenant_id, flow.namespace, flow.flow_id, limit],
                        row_to_execution,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list(&self, query: &ExecutionQuery) -> Result<Vec<Execution>, OrchestrationError> {
        let q = query.clone();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions
                     WHERE tenant_id = ?1
                       AND (?2 IS NULL OR namespace = ?2)
                       AND (?3 IS NULL OR flow_id = ?3)
                       AND (?4 IS NULL OR state_current = ?4)
                     ORDER BY {}",
                    EXECUTION_COLUMNS,
                    q.sort.order_by(q.order)
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            q.tenant_id,
                            q.namespace,
                            q.flow_id,
                            q.state.map(|s| s.as_str())
                        ],
                        row_to_execution,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_execution(row: &Row<'_>) -> Result<Execution, rusqlite::Error> {
    let labels: String = row.get(5)?;
    let trigger_id: Option<String> = row.get(6)?;
    let trigger_date: Option<i64> = row.get(7)?;
    let histories: String = row.get(8)?;

    let histories: Vec<StateHistory> = serde_json::from_str(&histories)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    let state = State::from_histories(histories)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, e.into()))?;

    Ok(Execution {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        namespace: row.get(2)?,
        flow_id: row.get(3)?,
        flow_revision: row.get(4)?,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        trigger: trigger_id.map(|trigger_id| ExecutionTrigger {
            trigger_id,
            date: opt_ms_to_dt(trigger_date).unwrap_or_else(|| ms_to_dt(0)),
        }),
        state,
        holds_concurrency_slot: row.get::<_, i64>(9)? != 0,
        version: row.get(10)?,
    })
}
