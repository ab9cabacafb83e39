//! Orchestration coordinator.
//!
//! The coordinator glues the trigger lock and admission control together:
//!   1. A trigger fires: take its lock, create the execution, ask for a slot
//!   2. The execution is persisted RUNNING or QUEUED and published
//!   3. The engine reports state changes through `transition`
//!   4. On a terminal state the slot is given back (promoting the head of the
//!      queue) and the trigger lock is released
//!
//! Terminal handling is idempotent: the slot is released through a
//! conditional write on the execution row and the lock only by its holder, so
//! the same terminal event may be handled any number of times, by any process.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::concurrency::{ConcurrencyLimitService, UNQUEUE_TARGETS};
use crate::error::OrchestrationError;
use crate::events::{ExecutionEvent, ExecutionEventBus};
use crate::models::concurrency_limit::ConcurrencyLimit;
use crate::models::execution::{Execution, ExecutionRequest, ExecutionTrigger};
use crate::models::flow::FlowKey;
use crate::models::state::StateType;
use crate::models::trigger::TriggerKey;
use crate::store::{ExecutionStore, SlotClaim};
use crate::triggers::TriggerLockManager;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity stamped on the triggers this process evaluates
    pub worker_id: String,
    /// Upper bound of queue entries looked at when a slot frees up
    pub max_promotion_attempts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_id: "cadence-worker".to_string(),
            max_promotion_attempts: 16,
        }
    }
}

/// Why a trigger fire did not produce an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Disabled,
    AlreadyLocked,
}

/// Result of firing a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FireOutcome {
    Started(Execution),
    Queued(Execution),
    #[serde(rename_all = "camelCase")]
    Skipped { trigger: TriggerKey, reason: SkipReason },
}

impl FireOutcome {
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            Self::Started(e) | Self::Queued(e) => Some(e),
            Self::Skipped { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    triggers: TriggerLockManager,
    admission: ConcurrencyLimitService,
    executions: ExecutionStore,
    event_bus: ExecutionEventBus,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        triggers: TriggerLockManager,
        admission: ConcurrencyLimitService,
        executions: ExecutionStore,
        event_bus: ExecutionEventBus,
    ) -> Self {
        let admission = admission.with_max_promotion_attempts(config.max_promotion_attempts);
        Self {
            config,
            triggers,
            admission,
            executions,
            event_bus,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Fire a trigger: lock it, create an execution and admit it.
    ///
    /// A disabled trigger, or one already being evaluated elsewhere, yields
    /// `FireOutcome::Skipped` rather than an error.
    pub async fn fire_trigger(
        &self,
        key: &TriggerKey,
        request: ExecutionRequest,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, OrchestrationError> {
        let trigger = self
            .triggers
            .get(key)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("Trigger {} not found", key)))?;
        if trigger.disabled {
            tracing::debug!("[Coordinator] Trigger {} is disabled, skipping", key);
            return Ok(FireOutcome::Skipped {
                trigger: key.clone(),
                reason: SkipReason::Disabled,
            });
        }

        let execution_id = Uuid::new_v4().to_string();
        match self.triggers.acquire(key, &execution_id, now).await {
            Ok(_) => {}
            Err(OrchestrationError::AlreadyLocked(_)) => {
                tracing::debug!("[Coordinator] Trigger {} is being evaluated elsewhere", key);
                return Ok(FireOutcome::Skipped {
                    trigger: key.clone(),
                    reason: SkipReason::AlreadyLocked,
                });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.triggers.mark_evaluated(key, now, &self.config.worker_id).await {
            tracing::warn!("[Coordinator] Failed to stamp evaluation of {}: {}", key, e);
        }

        let execution = Execution::new(
            execution_id.clone(),
            &key.flow,
            request,
            Some(ExecutionTrigger {
                trigger_id: key.trigger_id.clone(),
                date: now,
            }),
            now,
        );

        let execution = match self.admit_and_save(execution, now).await {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!(
                    "[Coordinator] Failed to create execution for trigger {}: {}",
                    key,
                    e
                );
                if let Err(unlock_err) = self.triggers.release(key, &execution_id).await {
                    tracing::error!("[Coordinator] Failed to release lock on {}: {}", key, unlock_err);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "[Coordinator] Trigger {} fired execution {} ({})",
            key,
            execution.id,
            execution.state.current()
        );
        Ok(if execution.state.current() == StateType::Queued {
            FireOutcome::Queued(execution)
        } else {
            FireOutcome::Started(execution)
        })
    }

    /// Create an execution without a trigger (manual run, subflow).
    pub async fn submit(
        &self,
        flow: &FlowKey,
        request: ExecutionRequest,
        now: DateTime<Utc>,
    ) -> Result<Execution, OrchestrationError> {
        let execution = Execution::new(Uuid::new_v4().to_string(), flow, request, None, now);
        let execution = self.admit_and_save(execution, now).await?;
        tracing::info!(
            "[Coordinator] Submitted execution {} of {} ({})",
            execution.id,
            flow,
            execution.state.current()
        );
        Ok(execution)
    }

    /// Apply a state change reported for an execution.
    ///
    /// Leaving the queue goes through admission control, and so does any move
    /// to RUNNING by an execution that holds no slot: on a flow at its limit
    /// such an execution is parked in QUEUED instead. Going back to QUEUED
    /// gives the slot back. Reaching a terminal state releases the slot and
    /// the trigger lock.
    pub async fn transition(
        &self,
        execution_id: &str,
        to: StateType,
        now: DateTime<Utc>,
    ) -> Result<Execution, OrchestrationError> {
        let mut execution = self.require(execution_id).await?;
        let previous = execution.state.current();
        if previous == StateType::Queued && UNQUEUE_TARGETS.contains(&to) {
            return self.unqueue(execution_id, to).await;
        }
        if execution.state.is_terminal() {
            return Err(OrchestrationError::IllegalTransition { from: previous, to });
        }

        let flow = execution.flow_key();
        let mut target = to;
        let mut claimed = false;
        let mut requeued = false;
        match to {
            StateType::Running if !execution.holds_concurrency_slot => {
                match self.admission.try_claim(&flow).await? {
                    SlotClaim::Claimed(_) => claimed = true,
                    SlotClaim::Unlimited => {}
                    SlotClaim::AtLimit => {
                        tracing::info!(
                            "[Coordinator] Execution {} holds no slot and {} is at its limit, queueing",
                            execution_id,
                            flow
                        );
                        target = StateType::Queued;
                    }
                }
            }
            StateType::Queued if execution.holds_concurrency_slot => requeued = true,
            _ => {}
        }

        execution.state.transition(target, now)?;
        execution.holds_concurrency_slot = (execution.holds_concurrency_slot || claimed) && !requeued;
        let saved = match self.executions.update(&execution).await {
            Ok(saved) => saved,
            Err(e) => {
                if claimed {
                    if let Err(give_back_err) = self.give_back_slot(&flow).await {
                        tracing::error!("[Coordinator] Failed to give back slot of {}: {}", flow, give_back_err);
                    }
                }
                return Err(e);
            }
        };
        tracing::debug!("[Coordinator] Execution {}: {} -> {}", saved.id, previous, target);
        self.event_bus.emit(ExecutionEvent::changed(saved.clone(), previous));

        if requeued {
            let changed = self.give_back_slot(&flow).await?;
            if let Some(promoted) = changed.into_iter().find(|e| e.id == saved.id) {
                return Ok(promoted);
            }
        }
        if saved.state.is_terminal() {
            self.on_execution_terminated(&saved).await?;
        }
        Ok(saved)
    }

    /// Side effects of an execution reaching a terminal state.
    ///
    /// Safe to call repeatedly for the same execution. Returns the queue
    /// entries that were promoted or cancelled as a consequence.
    pub async fn on_execution_terminated(&self, execution: &Execution) -> Result<Vec<Execution>, OrchestrationError> {
        if !execution.state.is_terminal() {
            tracing::debug!(
                "[Coordinator] Ignoring termination of {}, still {}",
                execution.id,
                execution.state.current()
            );
            return Ok(Vec::new());
        }

        let mut changed = Vec::new();
        if self.executions.release_slot(&execution.id).await? {
            changed = self.give_back_slot(&execution.flow_key()).await?;
        }

        self.release_trigger_lock(execution).await?;
        Ok(changed)
    }

    /// Set the limit of a flow and promote queued executions into any
    /// capacity it frees.
    pub async fn configure_limit(&self, flow: &FlowKey, limit: u32) -> Result<ConcurrencyLimit, OrchestrationError> {
        self.admission.configure(flow, limit).await?;
        self.promote_queued(flow).await?;
        self.admission.find_by_id(flow).await
    }

    /// Overwrite a limit record, `running` included, then promote queued
    /// executions into any capacity it frees.
    pub async fn update_limit(&self, limit: &ConcurrencyLimit) -> Result<ConcurrencyLimit, OrchestrationError> {
        let saved = self.admission.update(limit).await?;
        let flow = saved.flow_key();
        self.promote_queued(&flow).await?;
        self.admission.find_by_id(&flow).await
    }

    /// Administrative unqueue, with terminal handling when the target is one.
    pub async fn unqueue(&self, execution_id: &str, target: StateType) -> Result<Execution, OrchestrationError> {
        let execution = self.admission.unqueue(execution_id, target).await?;
        if execution.state.current() == StateType::Queued {
            tracing::info!("[Coordinator] Execution {} stays queued, flow is at its limit", execution_id);
            return Ok(execution);
        }

        tracing::info!("[Coordinator] Unqueued execution {} to {}", execution_id, target);
        self.event_bus.emit(ExecutionEvent::changed(execution.clone(), StateType::Queued));
        if execution.state.is_terminal() {
            self.on_execution_terminated(&execution).await?;
        }
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, OrchestrationError> {
        self.require(execution_id).await
    }

    /// Consume execution events and handle every terminal one.
    ///
    /// Returns when the bus is closed. Errors are logged and the loop goes on.
    pub async fn run(&self, mut receiver: broadcast::Receiver<ExecutionEvent>) {
        tracing::info!("[Coordinator] Listening for execution events");
        loop {
            match receiver.recv().await {
                Ok(event) if event.is_terminal() => {
                    if let Err(e) = self.on_execution_terminated(&event.execution).await {
                        tracing::error!(
                            "[Coordinator] Failed to handle termination of {}: {}",
                            event.execution.id,
                            e
                        );
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("[Coordinator] Event consumer lagged, {} events missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("[Coordinator] Event bus closed");
    }

    async fn admit_and_save(&self, mut execution: Execution, now: DateTime<Utc>) -> Result<Execution, OrchestrationError> {
        let flow = execution.flow_key();
        let claim = self.admission.try_claim(&flow).await?;
        let next = match claim {
            SlotClaim::AtLimit => StateType::Queued,
            SlotClaim::Claimed(_) | SlotClaim::Unlimited => StateType::Running,
        };
        execution.state.transition(next, now)?;
        execution.holds_concurrency_slot = matches!(claim, SlotClaim::Claimed(_));

        if let Err(e) = self.executions.save(&execution).await {
            if execution.holds_concurrency_slot {
                if let Err(give_back_err) = self.give_back_slot(&flow).await {
                    tracing::error!("[Coordinator] Failed to give back slot of {}: {}", flow, give_back_err);
                }
            }
            return Err(e);
        }

        self.event_bus.emit(ExecutionEvent::created(execution.clone()));
        Ok(execution)
    }

    /// Return one slot of `flow` and publish the queue entries that moved.
    async fn give_back_slot(&self, flow: &FlowKey) -> Result<Vec<Execution>, OrchestrationError> {
        let changed = self.admission.release(flow).await?;
        self.publish_dequeued(&changed).await?;
        Ok(changed)
    }

    async fn promote_queued(&self, flow: &FlowKey) -> Result<Vec<Execution>, OrchestrationError> {
        let changed = self.admission.promote(flow).await?;
        self.publish_dequeued(&changed).await?;
        Ok(changed)
    }

    /// Entries cancelled on their way out of the queue never ran, so their
    /// trigger lock is released here rather than by a terminal report.
    async fn publish_dequeued(&self, changed: &[Execution]) -> Result<(), OrchestrationError> {
        for entry in changed {
            self.event_bus.emit(ExecutionEvent::changed(entry.clone(), StateType::Queued));
            if entry.state.is_terminal() {
                self.release_trigger_lock(entry).await?;
            }
        }
        Ok(())
    }

    async fn release_trigger_lock(&self, execution: &Execution) -> Result<(), OrchestrationError> {
        if let Some(key) = execution.trigger_key() {
            if self.triggers.release(&key, &execution.id).await? {
                tracing::info!("[Coordinator] Released trigger {} held by {}", key, execution.id);
            }
        }
        Ok(())
    }

    async fn require(&self, execution_id: &str) -> Result<Execution, OrchestrationError> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("Execution {} not found", execution_id)))
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────

/// Periodically fires due triggers through the coordinator.
#[derive(Clone)]
pub struct Scheduler {
    coordinator: Coordinator,
    triggers: TriggerLockManager,
}

impl Scheduler {
    pub fn new(coordinator: Coordinator, triggers: TriggerLockManager) -> Self {
        Self { coordinator, triggers }
    }

    /// Fire every enabled, unlocked trigger whose next execution date has
    /// passed. One failing trigger does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<FireOutcome>, OrchestrationError> {
        let due = self.triggers.list_due(now).await?;
        if !due.is_empty() {
            tracing::debug!("[Scheduler] {} trigger(s) due", due.len());
        }

        let mut outcomes = Vec::with_capacity(due.len());
        for trigger in due {
            match self
                .coordinator
                .fire_trigger(&trigger.key, ExecutionRequest::default(), now)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!("[Scheduler] Failed to fire {}: {}", trigger.key, e),
            }
        }
        Ok(outcomes)
    }

    /// Tick every `interval` until `shutdown` resolves.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "[Scheduler] Worker {} started, interval {:?}",
            self.coordinator.config().worker_id,
            interval
        );
        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!("[Scheduler] Tick failed: {}", e);
                    }
                }
            }
        }
        tracing::info!("[Scheduler] Stopped");
    }
}
