use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a flow: the key for admission control and trigger ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowKey {
    pub tenant_id: String,
    pub namespace: String,
    pub flow_id: String,
}

impl FlowKey {
    pub fn new(
        tenant_id: impl Into<String>,
        namespace: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace: namespace.into(),
            flow_id: flow_id.into(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.namespace, self.flow_id)
    }
}
