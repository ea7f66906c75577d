//! ContextStore - the shared mutable aggregate and its change listeners
//!
//! Every mutation runs under the store lock, takes a snapshot, releases the lock,
//! and then calls listeners synchronously on the mutating thread. Listeners may
//! read the store again; they see the state at or after their notification.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::participant::Participant;

use super::types::{AgentContext, AgentStatus, AgentStatusUpdate, Channel, NewTest, SharedContext, TestContext, TestStatus};

/// Callback invoked after a mutation on a subscribed channel
///
/// Receives the channel the mutation belongs to and a snapshot taken right after it.
pub type ContextListener = dyn Fn(Channel, &SharedContext) -> eyre::Result<()> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    by_channel: HashMap<Channel, BTreeMap<u64, Arc<ContextListener>>>,
}

impl ListenerRegistry {
    /// Listeners for `channel`, then wildcard listeners unless `channel` is the wildcard
    fn for_channel(&self, channel: Channel) -> Vec<(u64, Arc<ContextListener>)> {
        let mut channels = vec![channel];
        if channel != Channel::All {
            channels.push(Channel::All);
        }
        channels
            .into_iter()
            .filter_map(|c| self.by_channel.get(&c))
            .flat_map(|listeners| listeners.iter().map(|(id, l)| (*id, l.clone())))
            .collect()
    }
}

struct StoreInner {
    state: Mutex<SharedContext>,
    listeners: Arc<Mutex<ListenerRegistry>>,
}

/// Registration token returned by `ContextStore::subscribe`
#[derive(Clone)]
pub struct ListenerHandle {
    registry: Weak<Mutex<ListenerRegistry>>,
    channel: Channel,
    id: u64,
}

impl ListenerHandle {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Remove this listener; returns false if it was already removed
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = lock(&registry);
        registry
            .by_channel
            .get_mut(&self.channel)
            .is_some_and(|listeners| listeners.remove(&self.id).is_some())
    }
}

/// Holds the current test, per-agent status and metadata, and notifies
/// category-scoped listeners of every change
///
/// Cloning shares the same state. Snapshots returned by getters are owned copies.
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<StoreInner>,
}

impl ContextStore {
    /// Create a store with every participant idle and no active test
    pub fn new() -> Self {
        debug!("ContextStore::new: called");
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(SharedContext::default()),
                listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            }),
        }
    }

    pub fn get_context(&self) -> SharedContext {
        lock(&self.inner.state).clone()
    }

    pub fn get_agent_context(&self, participant: Participant) -> AgentContext {
        lock(&self.inner.state)
            .agent(participant)
            .cloned()
            .unwrap_or_else(|| AgentContext::new(participant))
    }

    pub fn get_current_test(&self) -> Option<TestContext> {
        lock(&self.inner.state).current_test.clone()
    }

    /// Replace the active test with a fresh running one; the previous test is discarded
    pub fn start_test(&self, data: NewTest) -> TestContext {
        debug!(name = %data.name, url = %data.url, "ContextStore::start_test: called");
        let (test, snapshot) = self.mutate(|ctx| {
            if let Some(previous) = &ctx.current_test {
                debug!(previous = %previous.name, "Discarding previous test");
            }
            let test = TestContext::start(data);
            ctx.current_test = Some(test.clone());
            test
        });
        info!(name = %test.name, "Test started");
        self.notify(Channel::Test, &snapshot);
        test
    }

    /// Finish the active test; does nothing when no test is active
    pub fn finish_test(&self, status: TestStatus, error: Option<String>) -> Option<TestContext> {
        debug!(%status, ?error, "ContextStore::finish_test: called");
        let (finished, snapshot) = self.mutate(|ctx| {
            let test = ctx.current_test.as_mut()?;
            test.status = status;
            test.finished_at = Some(Utc::now());
            if error.is_some() {
                test.error = error;
            }
            Some(test.clone())
        });
        let Some(finished) = finished else {
            debug!("ContextStore::finish_test: no active test");
            return None;
        };
        info!(name = %finished.name, %status, "Test finished");
        self.notify(Channel::Test, &snapshot);
        Some(finished)
    }

    /// Apply the provided fields and refresh `last_activity`
    pub fn update_agent_status(&self, participant: Participant, update: AgentStatusUpdate) {
        debug!(%participant, ?update, "ContextStore::update_agent_status: called");
        let ((), snapshot) = self.mutate(|ctx| {
            let agent = agent_mut(ctx, participant);
            if let Some(task) = update.current_task {
                agent.current_task = Some(task);
            }
            if let Some(status) = update.status {
                agent.status = status;
            }
            agent.last_activity = Utc::now();
        });
        self.notify(Channel::Agent, &snapshot);
    }

    /// Count a finished task, fold its response time into the running mean,
    /// and return the agent to idle
    pub fn record_task_completion(&self, participant: Participant, success: bool, response_time_ms: u64) {
        debug!(%participant, success, response_time_ms, "ContextStore::record_task_completion: called");
        let ((), snapshot) = self.mutate(|ctx| {
            let agent = agent_mut(ctx, participant);
            agent.metrics.record(success, response_time_ms as f64);
            agent.status = AgentStatus::Idle;
            agent.current_task = None;
            agent.last_activity = Utc::now();
        });
        self.notify(Channel::Agent, &snapshot);
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!(%key, "ContextStore::set_metadata: called");
        let ((), snapshot) = self.mutate(|ctx| {
            ctx.metadata.insert(key, value);
        });
        self.notify(Channel::Metadata, &snapshot);
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        lock(&self.inner.state).metadata.get(key).cloned()
    }

    /// Metadata value deserialized into `T`; None if absent or of another shape
    pub fn get_metadata_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_metadata(key).and_then(|value| serde_json::from_value(value).ok())
    }

    /// Append a DOM snapshot id to the active test; silently ignored without one
    pub fn add_dom_snapshot(&self, snapshot_id: impl Into<String>) {
        let snapshot_id = snapshot_id.into();
        let mut state = lock(&self.inner.state);
        match state.current_test.as_mut() {
            Some(test) => test.dom_snapshots.push(snapshot_id),
            None => debug!(%snapshot_id, "ContextStore::add_dom_snapshot: no active test"),
        }
    }

    /// Append a screenshot path to the active test; silently ignored without one
    pub fn add_screenshot(&self, path: impl Into<String>) {
        let path = path.into();
        let mut state = lock(&self.inner.state);
        match state.current_test.as_mut() {
            Some(test) => test.screenshots.push(path),
            None => debug!(%path, "ContextStore::add_screenshot: no active test"),
        }
    }

    /// Listen for mutations on `channel`; `Channel::All` observes every category
    pub fn subscribe<F>(&self, channel: Channel, listener: F) -> ListenerHandle
    where
        F: Fn(Channel, &SharedContext) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.listeners);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_channel
            .entry(channel)
            .or_default()
            .insert(id, Arc::new(listener));
        debug!(%channel, id, "ContextStore::subscribe: registered listener");
        ListenerHandle {
            registry: Arc::downgrade(&self.inner.listeners),
            channel,
            id,
        }
    }

    /// Restore every agent to idle with zero metrics and drop the test and metadata
    pub fn reset(&self) {
        debug!("ContextStore::reset: called");
        let ((), snapshot) = self.mutate(|ctx| {
            *ctx = SharedContext::default();
        });
        info!("Context reset");
        self.notify(Channel::All, &snapshot);
    }

    /// Run `f` under the state lock and return its result with a post-mutation snapshot
    fn mutate<R>(&self, f: impl FnOnce(&mut SharedContext) -> R) -> (R, SharedContext) {
        let mut state = lock(&self.inner.state);
        let result = f(&mut state);
        (result, state.clone())
    }

    fn notify(&self, channel: Channel, snapshot: &SharedContext) {
        let listeners = lock(&self.inner.listeners).for_channel(channel);
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(channel, snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%channel, listener_id = id, error = %e, "Context listener failed"),
                Err(_) => warn!(%channel, listener_id = id, "Context listener panicked"),
            }
        }
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

fn agent_mut(ctx: &mut SharedContext, participant: Participant) -> &mut AgentContext {
    ctx.agents
        .entry(participant)
        .or_insert_with(|| AgentContext::new(participant))
}
