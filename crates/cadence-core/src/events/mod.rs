//! Execution event bus.
//!
//! Every state change the coordinator persists is published here. The
//! coordinator itself subscribes to the stream and reacts to terminal events
//! (see `Coordinator::run`). Delivery is at-least-once from the consumer's
//! point of view: the same terminal event may be observed more than once, so
//! consumers must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::execution::Execution;
use crate::models::state::StateType;

const DEFAULT_CAPACITY: usize = 1024;

/// Kind of change carried by an [`ExecutionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventType {
    ExecutionCreated,
    StateChanged,
    ExecutionTerminated,
}

impl ExecutionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionCreated => "EXECUTION_CREATED",
            Self::StateChanged => "STATE_CHANGED",
            Self::ExecutionTerminated => "EXECUTION_TERMINATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EXECUTION_CREATED" => Some(Self::ExecutionCreated),
            "STATE_CHANGED" => Some(Self::StateChanged),
            "EXECUTION_TERMINATED" => Some(Self::ExecutionTerminated),
            _ => None,
        }
    }

    /// Classify a freshly persisted execution.
    fn for_execution(execution: &Execution, created: bool) -> Self {
        if execution.state.is_terminal() {
            Self::ExecutionTerminated
        } else if created {
            Self::ExecutionCreated
        } else {
            Self::StateChanged
        }
    }
}

/// A persisted execution state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    pub execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<StateType>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn created(execution: Execution) -> Self {
        Self {
            event_type: ExecutionEventType::for_execution(&execution, true),
            execution,
            previous_state: None,
            timestamp: Utc::now(),
        }
    }

    pub fn changed(execution: Execution, previous_state: StateType) -> Self {
        Self {
            event_type: ExecutionEventType::for_execution(&execution, false),
            execution,
            previous_state: Some(previous_state),
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == ExecutionEventType::ExecutionTerminated
    }
}

/// Broadcast channel of execution events.
#[derive(Clone)]
pub struct ExecutionEventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn emit(&self, event: ExecutionEvent) {
        tracing::debug!(
            "[EventBus] {} {} ({})",
            event.event_type.as_str(),
            event.execution.id,
            event.execution.state.current()
        );
        let _ = self.sender.send(event);
    }
}

impl Default for ExecutionEventBus {
    fn default() -> Self {
        Self::new()
    }
}
