use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::FlowKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerKey {
    #[serde(flatten)]
    pub flow: FlowKey,
    pub trigger_id: String,
}

impl TriggerKey {
    pub fn new(flow: FlowKey, trigger_id: impl Into<String>) -> Self {
        Self {
            flow,
            trigger_id: trigger_id.into(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow, self.trigger_id)
    }
}

/// "Currently evaluating" marker on a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerLock {
    Unlocked,
    #[serde(rename_all = "camelCase")]
    LockedBy {
        execution_id: String,
        since: DateTime<Utc>,
    },
}

impl TriggerLock {
    pub fn from_columns(execution_id: Option<String>, since: Option<DateTime<Utc>>) -> Self {
        match (execution_id, since) {
            (Some(execution_id), Some(since)) => Self::LockedBy {
                execution_id,
                since,
            },
            // A token without a date still means "held"; epoch marks it as stale.
            (Some(execution_id), None) => Self::LockedBy {
                execution_id,
                since: DateTime::<Utc>::default(),
            },
            (None, _) => Self::Unlocked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(flatten)]
    pub key: TriggerKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub lock: TriggerLock,
}

impl Trigger {
    pub fn new(key: TriggerKey, next_execution_date: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            date: None,
            next_execution_date,
            disabled: false,
            worker_id: None,
            lock: TriggerLock::Unlocked,
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        match &self.lock {
            TriggerLock::LockedBy { execution_id, .. } => Some(execution_id),
            TriggerLock::Unlocked => None,
        }
    }

    pub fn evaluate_running_date(&self) -> Option<DateTime<Utc>> {
        match &self.lock {
            TriggerLock::LockedBy { since, .. } => Some(*since),
            TriggerLock::Unlocked => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.lock, TriggerLock::LockedBy { .. })
    }

    /// Enabled, unlocked, and its next execution date has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.disabled
            && !self.is_locked()
            && self.next_execution_date.is_some_and(|next| next <= now)
    }
}

/// Query used by the bulk trigger operations. `tenant_id` is mandatory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFilter {
    pub tenant_id: String,
    /// Matches the namespace itself and every child namespace.
    pub namespace: Option<String>,
    pub flow_id: Option<String>,
    pub locked: Option<bool>,
    pub disabled: Option<bool>,
}

impl TriggerFilter {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }
}
