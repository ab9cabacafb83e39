//! Shared wiring of the database, stores and services.

use std::sync::Arc;

use crate::concurrency::ConcurrencyLimitService;
use crate::db::Database;
use crate::events::ExecutionEventBus;
use crate::orchestration::{Coordinator, CoordinatorConfig, Scheduler};
use crate::store::{ConcurrencyLimitStore, ExecutionStore, TriggerStore};
use crate::triggers::TriggerLockManager;

/// Everything a process needs to take part in orchestration.
pub struct AppStateInner {
    pub db: Database,
    pub executions: ExecutionStore,
    pub trigger_locks: TriggerLockManager,
    pub admission: ConcurrencyLimitService,
    pub event_bus: ExecutionEventBus,
    pub coordinator: Coordinator,
    pub scheduler: Scheduler,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database) -> Self {
        Self::with_config(db, CoordinatorConfig::default())
    }

    pub fn with_config(db: Database, config: CoordinatorConfig) -> Self {
        let executions = ExecutionStore::new(db.clone());
        let trigger_store = TriggerStore::new(db.clone());
        let trigger_locks = TriggerLockManager::new(trigger_store.clone());
        let admission = ConcurrencyLimitService::new(
            ConcurrencyLimitStore::new(db.clone()),
            executions.clone(),
            trigger_store,
        )
        .with_max_promotion_attempts(config.max_promotion_attempts);
        let event_bus = ExecutionEventBus::new();
        let coordinator = Coordinator::new(
            config,
            trigger_locks.clone(),
            admission.clone(),
            executions.clone(),
            event_bus.clone(),
        );
        let scheduler = Scheduler::new(coordinator.clone(), trigger_locks.clone());
        Self {
            db,
            executions,
            trigger_locks,
            admission,
            event_bus,
            coordinator,
            scheduler,
        }
    }
}
