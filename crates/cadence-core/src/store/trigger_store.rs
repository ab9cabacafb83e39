use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};

use super::opt_ms_to_dt;
use crate::db::Database;
use crate::error::OrchestrationError;
use crate::models::trigger::{Trigger, TriggerFilter, TriggerKey, TriggerLock};

const TRIGGER_COLUMNS: &str = "tenant_id, namespace, flow_id, trigger_id, date, next_execution_date, \
     disabled, worker_id, execution_id, evaluate_running_date";

#[derive(Clone)]
pub struct TriggerStore {
    db: Database,
}

impl TriggerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a trigger or update its scheduling fields.
    ///
    /// The lock columns are only written on insert; an existing lock is never
    /// touched here.
    pub async fn upsert(&self, trigger: &Trigger) -> Result<(), OrchestrationError> {
        let t = trigger.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO triggers (tenant_id, namespace, flow_id, trigger_id, date, next_execution_date,
                     disabled, worker_id, execution_id, evaluate_running_date, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(tenant_id, namespace, flow_id, trigger_id) DO UPDATE SET
                       date = excluded.date,
                       next_execution_date = excluded.next_execution_date,
                       disabled = excluded.disabled,
                       worker_id = excluded.worker_id,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        t.key.flow.tenant_id,
                        t.key.flow.namespace,
                        t.key.flow.flow_id,
                        t.key.trigger_id,
                        t.date.map(|d| d.timestamp_millis()),
                        t.next_execution_date.map(|d| d.timestamp_millis()),
                        t.disabled as i64,
                        t.worker_id,
                        t.execution_id(),
                        t.evaluate_running_date().map(|d| d.timestamp_millis()),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, key: &TriggerKey) -> Result<Option<Trigger>, OrchestrationError> {
        let key = key.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM triggers
                         WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4",
                        TRIGGER_COLUMNS
                    ),
                    rusqlite::params![
                        key.flow.tenant_id,
                        key.flow.namespace,
                        key.flow.flow_id,
                        key.trigger_id
                    ],
                    row_to_trigger,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, OrchestrationError> {
        let f = filter.clone();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM triggers
                     WHERE tenant_id = ?1
                       AND (?2 IS NULL OR namespace = ?2
                            OR substr(namespace, 1, length(?2) + 1) = ?2 || '.')
                       AND (?3 IS NULL OR flow_id = ?3)
                       AND (?4 IS NULL OR (execution_id IS NOT NULL) = ?4)
                       AND (?5 IS NULL OR disabled = ?5)
                     ORDER BY namespace, flow_id, trigger_id",
                    TRIGGER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            f.tenant_id,
                            f.namespace,
                            f.flow_id,
                            f.locked.map(|b| b as i64),
                            f.disabled.map(|b| b as i64)
                        ],
                        row_to_trigger,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Enabled, unlocked triggers whose next execution date has passed.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>, OrchestrationError> {
        let now_ms = now.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM triggers
                     WHERE disabled = 0 AND execution_id IS NULL
                       AND next_execution_date IS NOT NULL AND next_execution_date <= ?1
                     ORDER BY next_execution_date ASC",
                    TRIGGER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms], row_to_trigger)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Compare-and-swap `Unlocked` → `LockedBy(execution_id, since)`.
    pub async fn try_lock(
        &self,
        key: &TriggerKey,
        execution_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, OrchestrationError> {
        let key = key.clone();
        let execution_id = execution_id.to_string();
        self.execute_on_key(
            key,
            "UPDATE triggers SET execution_id = ?5, evaluate_running_date = ?6, updated_at = ?7
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4
               AND execution_id IS NULL",
            vec![
                Some(execution_id.into()),
                Some(since.timestamp_millis().into()),
                Some(Utc::now().timestamp_millis().into()),
            ],
        )
        .await
    }

    /// Compare-and-swap `LockedBy(execution_id, _)` → `Unlocked`.
    pub async fn unlock_if_held_by(&self, key: &TriggerKey, execution_id: &str) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "UPDATE triggers SET execution_id = NULL, evaluate_running_date = NULL, updated_at = ?6
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4
               AND execution_id = ?5",
            vec![
                Some(execution_id.to_string().into()),
                Some(Utc::now().timestamp_millis().into()),
            ],
        )
        .await
    }

    /// `LockedBy(_, _)` → `Unlocked`, whoever holds it.
    pub async fn force_unlock(&self, key: &TriggerKey) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "UPDATE triggers SET execution_id = NULL, evaluate_running_date = NULL, updated_at = ?5
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4
               AND execution_id IS NOT NULL",
            vec![Some(Utc::now().timestamp_millis().into())],
        )
        .await
    }

    /// Clear the lock and make the trigger due at `now`.
    pub async fn reset_for_restart(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "UPDATE triggers SET execution_id = NULL, evaluate_running_date = NULL,
               next_execution_date = ?5, updated_at = ?6
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4",
            vec![
                Some(now.timestamp_millis().into()),
                Some(Utc::now().timestamp_millis().into()),
            ],
        )
        .await
    }

    /// Stamp the evaluation date and worker, and consume the pending next
    /// execution date.
    pub async fn mark_evaluated(
        &self,
        key: &TriggerKey,
        date: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "UPDATE triggers SET date = ?5, next_execution_date = NULL, worker_id = ?6, updated_at = ?7
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4",
            vec![
                Some(date.timestamp_millis().into()),
                Some(worker_id.to_string().into()),
                Some(Utc::now().timestamp_millis().into()),
            ],
        )
        .await
    }

    pub async fn set_disabled(&self, key: &TriggerKey, disabled: bool) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "UPDATE triggers SET disabled = ?5, updated_at = ?6
             WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4",
            vec![
                Some((disabled as i64).into()),
                Some(Utc::now().timestamp_millis().into()),
            ],
        )
        .await
    }

    pub async fn delete(&self, key: &TriggerKey) -> Result<bool, OrchestrationError> {
        self.execute_on_key(
            key.clone(),
            "DELETE FROM triggers WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND trigger_id = ?4",
            vec![],
        )
        .await
    }

    /// Run a single-row statement whose first four parameters are the key.
    /// Returns whether a row was affected.
    async fn execute_on_key(
        &self,
        key: TriggerKey,
        sql: &'static str,
        extra: Vec<Option<rusqlite::types::Value>>,
    ) -> Result<bool, OrchestrationError> {
        self.db
            .with_conn_async(move |conn| {
                let mut params: Vec<Option<rusqlite::types::Value>> = vec![
                    Some(key.flow.tenant_id.into()),
                    Some(key.flow.namespace.into()),
                    Some(key.flow.flow_id.into()),
                    Some(key.trigger_id.into()),
                ];
                params.extend(extra);
                let n = conn.execute(sql, rusqlite::params_from_iter(params))?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_trigger(row: &Row<'_>) -> Result<Trigger, rusqlite::Error> {
    let flow = crate::models::flow::FlowKey::new(
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
    );
    Ok(Trigger {
        key: TriggerKey::new(flow, row.get::<_, String>(3)?),
        date: opt_ms_to_dt(row.get(4)?),
        next_execution_date: opt_ms_to_dt(row.get(5)?),
        disabled: row.get::<_, i64>(6)? != 0,
        worker_id: row.get(7)?,
        lock: TriggerLock::from_columns(row.get(8)?, opt_ms_to_dt(row.get(9)?)),
    })
}
