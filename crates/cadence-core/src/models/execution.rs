use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::FlowKey;
use super::state::State;
use super::trigger::TriggerKey;

/// Back-reference from an execution to the trigger that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrigger {
    pub trigger_id: String,
    pub date: DateTime<Utc>,
}

/// One run instance of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub tenant_id: String,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ExecutionTrigger>,
    pub state: State,
    /// Whether this execution currently owns one unit of its flow's
    /// `running` counter.
    #[serde(default)]
    pub holds_concurrency_slot: bool,
    /// Row version used for optimistic updates.
    #[serde(default)]
    pub version: i64,
}

impl Execution {
    pub fn new(
        id: String,
        flow: &FlowKey,
        request: ExecutionRequest,
        trigger: Option<ExecutionTrigger>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.flow_id.clone(),
            flow_revision: request.flow_revision,
            labels: request.labels,
            trigger,
            state: State::new(now),
            holds_concurrency_slot: false,
            version: 0,
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(&self.tenant_id, &self.namespace, &self.flow_id)
    }

    pub fn trigger_key(&self) -> Option<TriggerKey> {
        self.trigger
            .as_ref()
            .map(|t| TriggerKey::new(self.flow_key(), &t.trigger_id))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.start_date()
    }
}

/// Input for creating a new execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default = "default_revision")]
    pub flow_revision: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            flow_revision: default_revision(),
            labels: BTreeMap::new(),
        }
    }
}

fn default_revision() -> u32 {
    1
}
