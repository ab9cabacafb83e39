//! Per-flow concurrency admission control.
//!
//! Each flow may carry a [`ConcurrencyLimit`] record. Its `running` counter is
//! only ever changed by single conditional statements, so any number of
//! processes can admit executions of the same flow without exceeding `limit`.
//! Executions that cannot start are parked in QUEUED; the queue is simply the
//! QUEUED executions of the flow ordered by creation time, then id.

use chrono::Utc;

use crate::error::OrchestrationError;
use crate::models::concurrency_limit::{AdmissionDecision, ConcurrencyLimit};
use crate::models::execution::Execution;
use crate::models::flow::FlowKey;
use crate::models::state::StateType;
use crate::store::{ConcurrencyLimitStore, ExecutionStore, SlotClaim, TriggerStore};

const DEFAULT_MAX_PROMOTION_ATTEMPTS: usize = 16;

/// Targets accepted by [`ConcurrencyLimitService::unqueue`].
pub const UNQUEUE_TARGETS: [StateType; 3] = [StateType::Running, StateType::Cancelled, StateType::Failed];

#[derive(Clone)]
pub struct ConcurrencyLimitService {
    limits: ConcurrencyLimitStore,
    executions: ExecutionStore,
    triggers: TriggerStore,
    max_promotion_attempts: usize,
}

impl ConcurrencyLimitService {
    pub fn new(limits: ConcurrencyLimitStore, executions: ExecutionStore, triggers: TriggerStore) -> Self {
        Self {
            limits,
            executions,
            triggers,
            max_promotion_attempts: DEFAULT_MAX_PROMOTION_ATTEMPTS,
        }
    }

    /// Bound the number of queue entries examined by a single `release`.
    pub fn with_max_promotion_attempts(mut self, attempts: usize) -> Self {
        self.max_promotion_attempts = attempts.max(1);
        self
    }

    /// Decide whether a new execution of `flow` may run now.
    pub async fn try_start(&self, flow: &FlowKey) -> Result<AdmissionDecision, OrchestrationError> {
        Ok(match self.try_claim(flow).await? {
            SlotClaim::Claimed(_) | SlotClaim::Unlimited => AdmissionDecision::Run,
            SlotClaim::AtLimit => AdmissionDecision::Queue,
        })
    }

    /// Like [`try_start`](Self::try_start) but tells the caller whether a
    /// slot was actually taken, i.e. whether it must be given back later.
    pub async fn try_claim(&self, flow: &FlowKey) -> Result<SlotClaim, OrchestrationError> {
        let claim = self.limits.try_claim_slot(flow).await?;
        match claim {
            SlotClaim::Claimed(running) => {
                tracing::debug!("[Admission] {} admitted (running={})", flow, running)
            }
            SlotClaim::AtLimit => tracing::debug!("[Admission] {} at limit, queueing", flow),
            SlotClaim::Unlimited => {}
        }
        Ok(claim)
    }

    /// Give back one slot of `flow` and hand the free capacity to the queue.
    ///
    /// Returns every execution whose state was changed, see [`promote`](Self::promote).
    pub async fn release(&self, flow: &FlowKey) -> Result<Vec<Execution>, OrchestrationError> {
        if let Some(running) = self.limits.release_slot(flow).await? {
            tracing::debug!("[Admission] {} released a slot (running={})", flow, running);
        }
        self.promote(flow).await
    }

    /// Promote the head of the queue while the flow has free slots.
    ///
    /// Queue entries whose trigger has since been deleted or disabled are
    /// cancelled instead of promoted. At most `max_promotion_attempts` entries
    /// are examined. Returns every execution whose state was changed,
    /// promoted or cancelled, in the order it happened.
    pub async fn promote(&self, flow: &FlowKey) -> Result<Vec<Execution>, OrchestrationError> {
        let mut changed = Vec::new();
        let mut skipped = std::collections::HashSet::new();
        for _ in 0..self.max_promotion_attempts {
            let candidate = self
                .executions
                .list_queued(flow, Some(skipped.len() as u32 + 1))
                .await?
                .into_iter()
                .find(|e| !skipped.contains(&e.id));
            let Some(candidate) = candidate else {
                break;
            };

            let target = if self.trigger_is_valid(&candidate).await? {
                StateType::Running
            } else {
                tracing::info!(
                    "[Admission] Cancelling queued execution {}: its trigger is gone or disabled",
                    candidate.id
                );
                StateType::Cancelled
            };

            match self.unqueue(&candidate.id, target).await {
                Ok(execution) if execution.state.current() == StateType::Queued => {
                    // At the limit; the queue waits for the next release.
                    break;
                }
                Ok(execution) => {
                    if execution.state.current() == StateType::Running {
                        tracing::info!("[Admission] Promoted execution {} of {}", execution.id, flow);
                    }
                    changed.push(execution);
                }
                Err(OrchestrationError::Conflict(_)) | Err(OrchestrationError::NotQueued(_)) => {
                    tracing::debug!(
                        "[Admission] Execution {} changed concurrently, trying next",
                        candidate.id
                    );
                    skipped.insert(candidate.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    /// Move a QUEUED execution out of the queue.
    ///
    /// RUNNING competes for a slot like any new execution; when the flow is
    /// still at its limit the execution is returned unchanged, still QUEUED.
    pub async fn unqueue(&self, execution_id: &str, target: StateType) -> Result<Execution, OrchestrationError> {
        if !UNQUEUE_TARGETS.contains(&target) {
            return Err(OrchestrationError::IllegalArgument(format!(
                "Cannot unqueue to {}, expected one of RUNNING, CANCELLED, FAILED",
                target
            )));
        }

        let mut execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("Execution {} not found", execution_id)))?;
        if execution.state.current() != StateType::Queued {
            return Err(OrchestrationError::NotQueued(format!(
                "Execution {} is {}",
                execution_id,
                execution.state.current()
            )));
        }

        let flow = execution.flow_key();
        let claimed = if target == StateType::Running && !execution.holds_concurrency_slot {
            match self.limits.try_claim_slot(&flow).await? {
                SlotClaim::AtLimit => return Ok(execution),
                SlotClaim::Claimed(_) => true,
                SlotClaim::Unlimited => false,
            }
        } else {
            false
        };

        execution.state.transition(target, Utc::now())?;
        execution.holds_concurrency_slot |= claimed;
        match self.executions.update(&execution).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                if claimed {
                    self.limits.release_slot(&flow).await?;
                }
                Err(e)
            }
        }
    }

    pub async fn queued(&self, flow: &FlowKey) -> Result<Vec<Execution>, OrchestrationError> {
        self.executions.list_queued(flow, None).await
    }

    pub async fn find(&self, tenant_id: &str) -> Result<Vec<ConcurrencyLimit>, OrchestrationError> {
        self.limits.list_by_tenant(tenant_id).await
    }

    pub async fn find_by_id(&self, flow: &FlowKey) -> Result<ConcurrencyLimit, OrchestrationError> {
        self.limits
            .get(flow)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("No concurrency limit for flow {}", flow)))
    }

    /// Operator override of a record, `running` included. Used to repair a
    /// counter that drifted after a crash.
    ///
    /// The queue is not touched here; call [`promote`](Self::promote) to hand
    /// out capacity the new values free up.
    pub async fn update(&self, limit: &ConcurrencyLimit) -> Result<ConcurrencyLimit, OrchestrationError> {
        let saved = self.limits.upsert(limit).await?;
        tracing::info!(
            "[Admission] {} set to limit={} running={}",
            saved.flow_key(),
            saved.limit,
            saved.running
        );
        Ok(saved)
    }

    /// Set the limit of a flow, keeping its current `running` value. Like
    /// [`update`](Self::update), it does not promote.
    pub async fn configure(&self, flow: &FlowKey, limit: u32) -> Result<ConcurrencyLimit, OrchestrationError> {
        let saved = self.limits.set_limit(flow, limit).await?;
        tracing::info!("[Admission] {} limit configured to {}", flow, limit);
        Ok(saved)
    }

    pub async fn delete(&self, flow: &FlowKey) -> Result<(), OrchestrationError> {
        if !self.limits.delete(flow).await? {
            return Err(OrchestrationError::NotFound(format!("No concurrency limit for flow {}", flow)));
        }
        tracing::info!("[Admission] {} limit removed", flow);
        Ok(())
    }

    async fn trigger_is_valid(&self, execution: &Execution) -> Result<bool, OrchestrationError> {
        let Some(key) = execution.trigger_key() else {
            return Ok(true);
        };
        Ok(self
            .triggers
            .get(&key)
            .await?
            .is_some_and(|trigger| !trigger.disabled))
    }
}
