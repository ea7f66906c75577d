//! Worker trait - the task execution seam the Coordinator drives

use async_trait::async_trait;
use eyre::Result;
use serde_json::Value;

use crate::bus::Message;
use crate::participant::Participant;

/// A specialized worker reachable through the bus
///
/// The Coordinator turns every `task:request` addressed to [`participant`](Worker::participant)
/// into a call to [`execute`](Worker::execute) and replies with its outcome.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The identity this worker receives messages as
    fn participant(&self) -> Participant;

    /// Run one task and produce the response payload
    async fn execute(&self, task: Value) -> Result<Value>;

    /// Observe a delivered message that is neither a task request nor a status query
    async fn on_event(&self, _message: &Message) -> Result<()> {
        Ok(())
    }
}

/// Short label for a task payload, used as the agent's current task
pub(crate) fn task_label(task: &Value) -> String {
    ["task", "action", "kind"]
        .iter()
        .find_map(|key| task.get(*key).and_then(Value::as_str))
        .or_else(|| task.as_str())
        .unwrap_or("task")
        .to_string()
}
