//! Trigger lock manager.
//!
//! A trigger is evaluated by at most one scheduler at a time. The "currently
//! evaluating" marker is the `execution_id` column of the trigger row, set and
//! cleared only through conditional writes in [`TriggerStore`], so the same
//! guarantee holds across processes sharing the database.
//!
//! There is no lease or timeout: a lock left behind by a crashed owner is
//! cleared by an operator through `unlock` or `restart`.

use chrono::{DateTime, Utc};

use crate::error::OrchestrationError;
use crate::models::trigger::{Trigger, TriggerFilter, TriggerKey};
use crate::store::TriggerStore;

#[derive(Clone)]
pub struct TriggerLockManager {
    store: TriggerStore,
}

impl TriggerLockManager {
    pub fn new(store: TriggerStore) -> Self {
        Self { store }
    }

    /// Create or reschedule a trigger. An existing lock is left as is.
    pub async fn register(&self, trigger: &Trigger) -> Result<Trigger, OrchestrationError> {
        self.store.upsert(trigger).await?;
        self.require(&trigger.key).await
    }

    pub async fn get(&self, key: &TriggerKey) -> Result<Option<Trigger>, OrchestrationError> {
        self.store.get(key).await
    }

    pub async fn list(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, OrchestrationError> {
        self.store.list(filter).await
    }

    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>, OrchestrationError> {
        self.store.list_due(now).await
    }

    /// Take the evaluation lock on behalf of `execution_id`.
    ///
    /// Losing the race yields `AlreadyLocked` and leaves the record untouched.
    pub async fn acquire(
        &self,
        key: &TriggerKey,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Trigger, OrchestrationError> {
        if self.store.try_lock(key, execution_id, now).await? {
            tracing::debug!("[TriggerLock] {} locked by {}", key, execution_id);
            return self.require(key).await;
        }

        match self.store.get(key).await? {
            None => Err(OrchestrationError::NotFound(format!("Trigger {} not found", key))),
            Some(current) => {
                tracing::debug!(
                    "[TriggerLock] {} already locked by {:?}, {} skipped",
                    key,
                    current.execution_id(),
                    execution_id
                );
                Err(OrchestrationError::AlreadyLocked(key.to_string()))
            }
        }
    }

    /// Give the lock back, but only if `execution_id` still holds it.
    ///
    /// Returns whether the lock was cleared; any other state is a no-op so the
    /// call can be repeated safely.
    pub async fn release(&self, key: &TriggerKey, execution_id: &str) -> Result<bool, OrchestrationError> {
        let released = self.store.unlock_if_held_by(key, execution_id).await?;
        if released {
            tracing::debug!("[TriggerLock] {} released by {}", key, execution_id);
        }
        Ok(released)
    }

    /// Record that `worker_id` evaluated the trigger at `now`. The pending next
    /// execution date is consumed; re-arming it belongs to the firing condition.
    pub async fn mark_evaluated(
        &self,
        key: &TriggerKey,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<(), OrchestrationError> {
        if !self.store.mark_evaluated(key, now, worker_id).await? {
            return Err(OrchestrationError::NotFound(format!("Trigger {} not found", key)));
        }
        Ok(())
    }

    /// Clear the lock regardless of its owner.
    pub async fn unlock(&self, key: &TriggerKey) -> Result<Trigger, OrchestrationError> {
        if self.store.force_unlock(key).await? {
            tracing::info!("[TriggerLock] {} unlocked", key);
            return self.require(key).await;
        }
        match self.store.get(key).await? {
            None => Err(OrchestrationError::NotFound(format!("Trigger {} not found", key))),
            Some(_) => Err(OrchestrationError::NotLocked(key.to_string())),
        }
    }

    /// Unlock every listed trigger that is currently locked.
    pub async fn unlock_many(&self, keys: &[TriggerKey]) -> Result<usize, OrchestrationError> {
        let mut count = 0;
        for key in keys {
            match self.unlock(key).await {
                Ok(_) => count += 1,
                Err(OrchestrationError::NotLocked(_)) | Err(OrchestrationError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("[TriggerLock] Failed to unlock {}: {}", key, e);
                }
            }
        }
        Ok(count)
    }

    pub async fn unlock_matching(&self, filter: &TriggerFilter) -> Result<usize, OrchestrationError> {
        let keys = self.matching_keys(filter).await?;
        self.unlock_many(&keys).await
    }

    /// Clear the lock and make the trigger due immediately.
    pub async fn restart(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<Trigger, OrchestrationError> {
        if !self.store.reset_for_restart(key, now).await? {
            return Err(OrchestrationError::NotFound(format!("Trigger {} not found", key)));
        }
        tracing::info!("[TriggerLock] {} restarted", key);
        self.require(key).await
    }

    pub async fn set_disabled(&self, key: &TriggerKey, disabled: bool) -> Result<Trigger, OrchestrationError> {
        if !self.store.set_disabled(key, disabled).await? {
            return Err(OrchestrationError::NotFound(format!("Trigger {} not found", key)));
        }
        tracing::info!(
            "[TriggerLock] {} {}",
            key,
            if disabled { "disabled" } else { "enabled" }
        );
        self.require(key).await
    }

    pub async fn set_disabled_many(&self, keys: &[TriggerKey], disabled: bool) -> Result<usize, OrchestrationError> {
        let mut count = 0;
        for key in keys {
            match self.store.set_disabled(key, disabled).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("[TriggerLock] Failed to update {}: {}", key, e),
            }
        }
        Ok(count)
    }

    pub async fn set_disabled_matching(
        &self,
        filter: &TriggerFilter,
        disabled: bool,
    ) -> Result<usize, OrchestrationError> {
        let keys = self.matching_keys(filter).await?;
        self.set_disabled_many(&keys, disabled).await
    }

    pub async fn delete(&self, key: &TriggerKey) -> Result<(), OrchestrationError> {
        if !self.store.delete(key).await? {
            return Err(OrchestrationError::NotFound(format!("Trigger {} not found", key)));
        }
        tracing::info!("[TriggerLock] {} deleted", key);
        Ok(())
    }

    pub async fn delete_many(&self, keys: &[TriggerKey]) -> Result<usize, OrchestrationError> {
        let mut count = 0;
        for key in keys {
            match self.store.delete(key).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("[TriggerLock] Failed to delete {}: {}", key, e),
            }
        }
        Ok(count)
    }

    pub async fn delete_matching(&self, filter: &TriggerFilter) -> Result<usize, OrchestrationError> {
        let keys = self.matching_keys(filter).await?;
        self.delete_many(&keys).await
    }

    async fn matching_keys(&self, filter: &TriggerFilter) -> Result<Vec<TriggerKey>, OrchestrationError> {
        if filter.tenant_id.is_empty() {
            return Err(OrchestrationError::IllegalArgument(
                "tenantId is required for bulk trigger operations".to_string(),
            ));
        }
        Ok(self
            .store
            .list(filter)
            .await?
            .into_iter()
            .map(|t| t.key)
            .collect())
    }

    async fn require(&self, key: &TriggerKey) -> Result<Trigger, OrchestrationError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("Trigger {} not found", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::flow::FlowKey;
    use crate::models::trigger::TriggerLock;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key(trigger_id: &str) -> TriggerKey {
        TriggerKey::new(FlowKey::new("main", "company.team", "etl"), trigger_id)
    }

    async fn manager_with(ids: &[&str]) -> TriggerLockManager {
        let manager = TriggerLockManager::new(TriggerStore::new(Database::open_in_memory().unwrap()));
        for id in ids {
            manager.register(&Trigger::new(key(id), Some(t(0)))).await.unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_second_acquire_fails_then_unlock_twice() {
        let manager = manager_with(&["T"]).await;

        let locked = manager.acquire(&key("T"), "X", t(1)).await.unwrap();
        assert_eq!(locked.execution_id(), Some("X"));

        let err = manager.acquire(&key("T"), "Y", t(2)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AlreadyLocked(_)));
        let unchanged = manager.get(&key("T")).await.unwrap().unwrap();
        assert_eq!(
            unchanged.lock,
            TriggerLock::LockedBy {
                execution_id: "X".to_string(),
                since: t(1)
            }
        );

        let unlocked = manager.unlock(&key("T")).await.unwrap();
        assert_eq!(unlocked.lock, TriggerLock::Unlocked);
        assert_eq!(unlocked.next_execution_date, unchanged.next_execution_date);

        let err = manager.unlock(&key("T")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NotLocked(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let manager = manager_with(&["T"]).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(&key("T"), &format!("exec-{}", i), t(1)).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, OrchestrationError::AlreadyLocked(_))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_not_found() {
        let manager = manager_with(&[]).await;
        assert!(matches!(
            manager.acquire(&key("nope"), "X", t(0)).await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
        assert!(matches!(
            manager.unlock(&key("nope")).await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
        assert!(matches!(
            manager.restart(&key("nope"), t(0)).await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_release_only_by_holder_and_idempotent() {
        let manager = manager_with(&["T"]).await;
        manager.acquire(&key("T"), "X", t(1)).await.unwrap();

        assert!(!manager.release(&key("T"), "Y").await.unwrap());
        assert!(manager.release(&key("T"), "X").await.unwrap());
        assert!(!manager.release(&key("T"), "X").await.unwrap());
        assert!(!manager.get(&key("T")).await.unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_restart_forces_reevaluation() {
        let manager = manager_with(&["T"]).await;
        manager.acquire(&key("T"), "X", t(1)).await.unwrap();

        let restarted = manager.restart(&key("T"), t(30)).await.unwrap();
        assert!(!restarted.is_locked());
        assert_eq!(restarted.next_execution_date, Some(t(30)));
        assert!(restarted.is_due(t(30)));
    }

    #[tokio::test]
    async fn test_bulk_operations_report_counts() {
        let manager = manager_with(&["a", "b", "c"]).await;
        manager.acquire(&key("a"), "X", t(1)).await.unwrap();
        manager.acquire(&key("b"), "Y", t(1)).await.unwrap();

        let all = TriggerFilter::tenant("main");
        assert_eq!(manager.unlock_matching(&all).await.unwrap(), 2);
        assert_eq!(manager.unlock_matching(&all).await.unwrap(), 0);

        assert_eq!(
            manager
                .set_disabled_many(&[key("a"), key("missing")], true)
                .await
                .unwrap(),
            1
        );
        let disabled = TriggerFilter {
            disabled: Some(true),
            ..TriggerFilter::tenant("main")
        };
        assert_eq!(manager.list(&disabled).await.unwrap().len(), 1);
        assert_eq!(manager.set_disabled_matching(&all, false).await.unwrap(), 3);
        assert!(manager.list(&disabled).await.unwrap().is_empty());

        assert_eq!(manager.delete_many(&[key("a"), key("a")]).await.unwrap(), 1);
        assert_eq!(manager.delete_matching(&all).await.unwrap(), 2);
        assert!(matches!(
            manager.delete(&key("b")).await.unwrap_err(),
            OrchestrationError::NotFound(_)
        ));

        let err = manager.unlock_matching(&TriggerFilter::default()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::IllegalArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_matching_stays_inside_the_namespace() {
        let manager = TriggerLockManager::new(TriggerStore::new(Database::open_in_memory().unwrap()));
        for namespace in ["a_b", "axb.child", "A_B.Team"] {
            let k = TriggerKey::new(FlowKey::new("main", namespace, "etl"), "T");
            manager.register(&Trigger::new(k, Some(t(0)))).await.unwrap();
        }

        let filter = TriggerFilter {
            namespace: Some("a_b".to_string()),
            ..TriggerFilter::tenant("main")
        };
        assert_eq!(manager.delete_matching(&filter).await.unwrap(), 1);

        let left: Vec<String> = manager
            .list(&TriggerFilter::tenant("main"))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.key.flow.namespace)
            .collect();
        assert_eq!(left, vec!["A_B.Team", "axb.child"]);
    }
}
