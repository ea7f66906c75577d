//! Shared context store
//!
//! Holds the active test run, per-participant status and metrics, and free-form
//! metadata, and notifies listeners subscribed to the `test`, `agent`, `metadata`
//! or `*` channels.

mod store;
mod types;

pub use store::{ContextListener, ContextStore, ListenerHandle};
pub use types::{
    AgentContext, AgentMetrics, AgentStatus, AgentStatusUpdate, Channel, NewTest, SharedContext, TestContext,
    TestStatus,
};
