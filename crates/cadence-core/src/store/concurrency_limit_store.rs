use chrono::Utc;
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::OrchestrationError;
use crate::models::concurrency_limit::ConcurrencyLimit;
use crate::models::flow::FlowKey;

/// Result of a conditional slot claim on a concurrency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClaim {
    /// `running` was below `limit` and has been incremented to the value.
    Claimed(u32),
    /// The flow is at (or above) its limit; nothing was written.
    AtLimit,
    /// No record exists for the flow, so it is not limited.
    Unlimited,
}

#[derive(Clone)]
pub struct ConcurrencyLimitStore {
    db: Database,
}

impl ConcurrencyLimitStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, flow: &FlowKey) -> Result<Option<ConcurrencyLimit>, OrchestrationError> {
        let flow = flow.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT tenant_id, namespace, flow_id, limit_value, running
                     FROM concurrency_limits WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3",
                    rusqlite::params![flow.tenant_id, flow.namespace, flow.flow_id],
                    row_to_limit,
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<ConcurrencyLimit>, OrchestrationError> {
        let tenant_id = tenant_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT tenant_id, namespace, flow_id, limit_value, running
                     FROM concurrency_limits WHERE tenant_id = ?1 ORDER BY namespace, flow_id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![tenant_id], row_to_limit)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Increment `running` if and only if it is below `limit`.
    ///
    /// The check and the write are one statement, so concurrent claimers on
    /// the same flow can never push `running` past `limit`.
    pub async fn try_claim_slot(&self, flow: &FlowKey) -> Result<SlotClaim, OrchestrationError> {
        let flow = flow.clone();
        self.db
            .with_conn_async(move |conn| {
                let claimed: Option<u32> = conn
                    .query_row(
                        "UPDATE concurrency_limits SET running = running + 1, updated_at = ?4
                         WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3 AND running < limit_value
                         RETURNING running",
                        rusqlite::params![
                            flow.tenant_id,
                            flow.namespace,
                            flow.flow_id,
                            Utc::now().timestamp_millis()
                        ],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(running) = claimed {
                    return Ok(SlotClaim::Claimed(running));
                }
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM concurrency_limits WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3",
                        rusqlite::params![flow.tenant_id, flow.namespace, flow.flow_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                Ok(if exists { SlotClaim::AtLimit } else { SlotClaim::Unlimited })
            })
            .await
    }

    /// Decrement `running`, never below zero. Returns the new value, or
    /// `None` when the flow has no record.
    pub async fn release_slot(&self, flow: &FlowKey) -> Result<Option<u32>, OrchestrationError> {
        let flow = flow.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "UPDATE concurrency_limits SET running = MAX(running - 1, 0), updated_at = ?4
                     WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3
                     RETURNING running",
                    rusqlite::params![
                        flow.tenant_id,
                        flow.namespace,
                        flow.flow_id,
                        Utc::now().timestamp_millis()
                    ],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    /// Insert or overwrite a record, `running` included.
    pub async fn upsert(&self, limit: &ConcurrencyLimit) -> Result<ConcurrencyLimit, OrchestrationError> {
        let l = limit.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "INSERT INTO concurrency_limits (tenant_id, namespace, flow_id, limit_value, running, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(tenant_id, namespace, flow_id) DO UPDATE SET
                       limit_value = excluded.limit_value,
                       running = excluded.running,
                       updated_at = excluded.updated_at
                     RETURNING tenant_id, namespace, flow_id, limit_value, running",
                    rusqlite::params![
                        l.tenant_id,
                        l.namespace,
                        l.flow_id,
                        l.limit,
                        l.running,
                        Utc::now().timestamp_millis()
                    ],
                    row_to_limit,
                )
            })
            .await
    }

    /// Set the limit of a flow, creating the record if needed and keeping the
    /// current `running` value otherwise.
    pub async fn set_limit(&self, flow: &FlowKey, limit: u32) -> Result<ConcurrencyLimit, OrchestrationError> {
        let flow = flow.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "INSERT INTO concurrency_limits (tenant_id, namespace, flow_id, limit_value, running, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)
                     ON CONFLICT(tenant_id, namespace, flow_id) DO UPDATE SET
                       limit_value = excluded.limit_value,
                       updated_at = excluded.updated_at
                     RETURNING tenant_id, namespace, flow_id, limit_value, running",
                    rusqlite::params![
                        flow.tenant_id,
                        flow.namespace,
                        flow.flow_id,
                        limit,
                        Utc::now().timestamp_millis()
                    ],
                    row_to_limit,
                )
            })
            .await
    }

    pub async fn delete(&self, flow: &FlowKey) -> Result<bool, OrchestrationError> {
        let flow = flow.clone();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM concurrency_limits WHERE tenant_id = ?1 AND namespace = ?2 AND flow_id = ?3",
                    rusqlite::params![flow.tenant_id, flow.namespace, flow.flow_id],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_limit(row: &Row<'_>) -> Result<ConcurrencyLimit, rusqlite::Error> {
    Ok(ConcurrencyLimit {
        tenant_id: row.get(0)?,
        namespace: row.get(1)?,
        flow_id: row.get(2)?,
        limit: row.get(3)?,
        running: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowKey {
        FlowKey::new("main", "company.team", "etl")
    }

    #[tokio::test]
    async fn test_claim_without_record_is_unlimited() {
        let store = ConcurrencyLimitStore::new(Database::open_in_memory().unwrap());
        assert_eq!(store.try_claim_slot(&flow()).await.unwrap(), SlotClaim::Unlimited);
        assert!(store.get(&flow()).await.unwrap().is_none());
        assert_eq!(store.release_slot(&flow()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claims_stop_at_limit_and_release_floors_at_zero() {
        let store = ConcurrencyLimitStore::new(Database::open_in_memory().unwrap());
        store.set_limit(&flow(), 2).await.unwrap();

        assert_eq!(store.try_claim_slot(&flow()).await.unwrap(), SlotClaim::Claimed(1));
        assert_eq!(store.try_claim_slot(&flow()).await.unwrap(), SlotClaim::Claimed(2));
        assert_eq!(store.try_claim_slot(&flow()).await.unwrap(), SlotClaim::AtLimit);
        assert_eq!(store.get(&flow()).await.unwrap().unwrap().running, 2);

        assert_eq!(store.release_slot(&flow()).await.unwrap(), Some(1));
        assert_eq!(store.release_slot(&flow()).await.unwrap(), Some(0));
        assert_eq!(store.release_slot(&flow()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_set_limit_keeps_running_and_upsert_overrides_it() {
        let store = ConcurrencyLimitStore::new(Database::open_in_memory().unwrap());
        store.set_limit(&flow(), 1).await.unwrap();
        store.try_claim_slot(&flow()).await.unwrap();

        let raised = store.set_limit(&flow(), 5).await.unwrap();
        assert_eq!((raised.limit, raised.running), (5, 1));

        let mut repaired = raised.clone();
        repaired.running = 0;
        let saved = store.upsert(&repaired).await.unwrap();
        assert_eq!(saved.running, 0);

        let other = ConcurrencyLimit::new(&FlowKey::new("main", "company", "other"), 3);
        store.upsert(&other).await.unwrap();
        let all = store.list_by_tenant("main").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].flow_id, "other");
        assert!(store.list_by_tenant("elsewhere").await.unwrap().is_empty());

        assert!(store.delete(&flow()).await.unwrap());
        assert!(!store.delete(&flow()).await.unwrap());
    }
}
