use serde::{Deserialize, Serialize};

use super::flow::FlowKey;

/// Per-flow concurrency counter.
///
/// One record per (tenant, namespace, flow). `running` is only ever changed by
/// conditional writes, or forcibly by an operator repairing drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimit {
    pub tenant_id: String,
    pub namespace: String,
    pub flow_id: String,
    pub limit: u32,
    pub running: u32,
}

impl ConcurrencyLimit {
    pub fn new(flow: &FlowKey, limit: u32) -> Self {
        Self {
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.flow_id.clone(),
            limit,
            running: 0,
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(&self.tenant_id, &self.namespace, &self.flow_id)
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionDecision {
    Run,
    Queue,
}
