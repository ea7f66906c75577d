//! Shared context data model

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::participant::Participant;

/// Category of a context mutation; `All` is the `'*'` wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "test")]
    Test,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "metadata")]
    Metadata,
    #[serde(rename = "*")]
    All,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Test => "test",
            Channel::Agent => "agent",
            Channel::Metadata => "metadata",
            Channel::All => "*",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-agent task counters and running mean of response time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(rename = "tasks-completed")]
    pub tasks_completed: u64,
    #[serde(rename = "tasks-errored")]
    pub tasks_errored: u64,
    #[serde(rename = "avg-response-time-ms")]
    pub avg_response_time_ms: f64,
}

impl AgentMetrics {
    /// Total tasks recorded, successful or not
    pub fn total_tasks(&self) -> u64 {
        self.tasks_completed + self.tasks_errored
    }

    /// Count one task and fold `response_time_ms` into the running mean
    pub(crate) fn record(&mut self, success: bool, response_time_ms: f64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_errored += 1;
        }
        let n = self.total_tasks() as f64;
        self.avg_response_time_ms = (self.avg_response_time_ms * (n - 1.0) + response_time_ms) / n;
    }
}

/// Status of one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub participant: Participant,
    #[serde(rename = "current-task", default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub status: AgentStatus,
    #[serde(rename = "last-activity")]
    pub last_activity: DateTime<Utc>,
    pub metrics: AgentMetrics,
}

impl AgentContext {
    /// Idle agent with zero metrics
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            current_task: None,
            status: AgentStatus::Idle,
            last_activity: Utc::now(),
            metrics: AgentMetrics::default(),
        }
    }
}

/// Partial update for `ContextStore::update_agent_status`; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatusUpdate {
    pub current_task: Option<String>,
    pub status: Option<AgentStatus>,
}

impl AgentStatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Busy on the given task
    pub fn busy(task: impl Into<String>) -> Self {
        Self::new().status(AgentStatus::Busy).task(task)
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Passed,
    Failed,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Data supplied to `ContextStore::start_test`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTest {
    pub url: String,
    pub file: String,
    pub name: String,
}

impl NewTest {
    pub fn new(url: impl Into<String>, file: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file: file.into(),
            name: name.into(),
        }
    }
}

/// The active test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestContext {
    pub url: String,
    pub file: String,
    pub name: String,
    pub status: TestStatus,
    #[serde(rename = "started-at")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "finished-at", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Screenshot paths, in capture order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
    /// DOM snapshot ids, in capture order
    #[serde(rename = "dom-snapshots", default, skip_serializing_if = "Vec::is_empty")]
    pub dom_snapshots: Vec<String>,
}

impl TestContext {
    pub(crate) fn start(data: NewTest) -> Self {
        Self {
            url: data.url,
            file: data.file,
            name: data.name,
            status: TestStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            screenshots: Vec::new(),
            dom_snapshots: Vec::new(),
        }
    }
}

/// The single shared aggregate: active test, every agent, free-form metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    #[serde(rename = "current-test", default, skip_serializing_if = "Option::is_none")]
    pub current_test: Option<TestContext>,
    /// One entry per participant, always present
    pub agents: BTreeMap<Participant, AgentContext>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl SharedContext {
    /// The entry for `participant`; `None` only for a context built or deserialized without it
    pub fn agent(&self, participant: Participant) -> Option<&AgentContext> {
        self.agents.get(&participant)
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self {
            current_test: None,
            agents: Participant::ALL
                .into_iter()
                .map(|p| (p, AgentContext::new(p)))
                .collect(),
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_covers_every_participant() {
        let ctx = SharedContext::default();
        assert_eq!(ctx.agents.len(), Participant::ALL.len());
        for p in Participant::ALL {
            let agent = ctx.agent(p).unwrap();
            assert_eq!(agent.participant, p);
            assert_eq!(agent.status, AgentStatus::Idle);
            assert_eq!(agent.metrics, AgentMetrics::default());
        }
        assert!(ctx.current_test.is_none());
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn test_agent_lookup_on_partial_context() {
        let ctx: SharedContext = serde_json::from_value(serde_json::json!({"agents": {}})).unwrap();
        assert!(ctx.agent(Participant::Analyst).is_none());
    }

    #[test]
    fn test_incremental_mean() {
        let mut metrics = AgentMetrics::default();
        metrics.record(true, 100.0);
        metrics.record(false, 300.0);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_errored, 1);
        assert_eq!(metrics.avg_response_time_ms, 200.0);
    }

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(serde_json::to_string(&Channel::All).unwrap(), "\"*\"");
        assert_eq!(serde_json::from_str::<Channel>("\"agent\"").unwrap(), Channel::Agent);
    }

    #[test]
    fn test_shared_context_serializes_agents_by_name() {
        let json = serde_json::to_value(SharedContext::default()).unwrap();
        assert!(json["agents"]["test-author"].is_object());
        assert_eq!(json["agents"]["analyst"]["status"], "idle");
        assert!(json.get("current-test").is_none());
    }
}
