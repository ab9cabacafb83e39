pub mod concurrency_limit;
pub mod execution;
pub mod flow;
pub mod state;
pub mod trigger;

pub use concurrency_limit::*;
pub use execution::*;
pub use flow::*;
pub use state::*;
pub use trigger::*;
