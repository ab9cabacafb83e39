pub mod concurrency_limit_store;
pub mod execution_store;
pub mod trigger_store;

pub use concurrency_limit_store::{ConcurrencyLimitStore, SlotClaim};
pub use execution_store::{ExecutionQuery, ExecutionSort, ExecutionStore};
pub use trigger_store::TriggerStore;

use chrono::{DateTime, Utc};

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}
