//! Coordinator - bridges worker handlers on the bus with the context store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Context, Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::bus::{BusResult, Message, MessageBus, MessageType, OutgoingMessage, Subscription};
use crate::context::{AgentContext, AgentStatus, AgentStatusUpdate, ContextStore};
use crate::participant::Participant;

use super::worker::{Worker, task_label};

/// Owns the registrations of every worker and dispatches tasks on the coordinator's behalf
///
/// The Coordinator is the only component that reads and writes the store on behalf of
/// workers: a task request marks the worker busy, the outcome is recorded with its
/// elapsed time, and the reply goes back through the bus.
pub struct Coordinator {
    bus: MessageBus,
    store: ContextStore,
    workers: HashMap<Participant, Subscription>,
}

impl Coordinator {
    /// Create a coordinator over an existing bus and store
    pub fn new(bus: MessageBus, store: ContextStore) -> Self {
        debug!("Coordinator::new: called");
        Self {
            bus,
            store,
            workers: HashMap::new(),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Participants with a registered worker
    pub fn registered(&self) -> Vec<Participant> {
        let mut registered: Vec<_> = self.workers.keys().copied().collect();
        registered.sort();
        registered
    }

    /// Install the bus handler for `worker`
    pub fn register_worker(&mut self, worker: Arc<dyn Worker>) -> Result<()> {
        let participant = worker.participant();
        if !participant.is_worker() {
            return Err(eyre!("Cannot register a worker as {}", participant));
        }
        if self.workers.contains_key(&participant) {
            return Err(eyre!("Worker already registered for {}", participant));
        }

        let bus = self.bus.clone();
        let store = self.store.clone();
        let subscription = self.bus.subscribe(participant, move |message: Message| {
            let bus = bus.clone();
            let store = store.clone();
            let worker = worker.clone();
            async move { handle_delivery(&bus, &store, worker.as_ref(), participant, message).await }
        });

        self.workers.insert(participant, subscription);
        info!(%participant, "Worker registered");
        Ok(())
    }

    /// Remove the handler for `participant`; returns false if none was registered
    pub fn unregister_worker(&mut self, participant: Participant) -> bool {
        match self.workers.remove(&participant) {
            Some(subscription) => {
                subscription.unsubscribe();
                info!(%participant, "Worker unregistered");
                true
            }
            None => false,
        }
    }

    /// Send a task to `to` and wait for its result, using the bus's default timeout
    pub async fn dispatch(&self, to: Participant, task: Value) -> BusResult<Value> {
        debug!(%to, "Coordinator::dispatch: called");
        self.bus.request(Participant::Coordinator, to, task).await
    }

    /// Send a task to `to` and wait up to `timeout` for its result
    pub async fn dispatch_with_timeout(&self, to: Participant, task: Value, timeout: Duration) -> BusResult<Value> {
        debug!(%to, ?timeout, "Coordinator::dispatch_with_timeout: called");
        self.bus
            .request_with_timeout(Participant::Coordinator, to, task, timeout)
            .await
    }

    /// Broadcast an event from the coordinator to every worker
    pub async fn announce(&self, message_type: MessageType, payload: Value) -> Message {
        debug!(%message_type, "Coordinator::announce: called");
        self.bus
            .publish(OutgoingMessage::broadcast(Participant::Coordinator, message_type, payload))
            .await
    }

    /// Ask a worker for its status over the bus
    ///
    /// The reply is produced by the worker's registered handler, so an unregistered
    /// worker times out.
    pub async fn query_status(&self, to: Participant, timeout: Duration) -> Result<AgentContext> {
        debug!(%to, "Coordinator::query_status: called");
        let payload = self
            .bus
            .request_typed(Participant::Coordinator, to.into(), MessageType::StatusQuery, Value::Null, timeout)
            .await
            .context(format!("Status query to {} failed", to))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Drop every worker registration; returns how many were removed
    pub fn shutdown(&mut self) -> usize {
        let count = self.workers.len();
        if count == 0 {
            return 0;
        }
        info!(workers = count, "Coordinator shutting down");
        for (_, subscription) in self.workers.drain() {
            subscription.unsubscribe();
        }
        count
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// React to one message delivered to a worker
async fn handle_delivery(
    bus: &MessageBus,
    store: &ContextStore,
    worker: &dyn Worker,
    participant: Participant,
    message: Message,
) -> Result<()> {
    match message.message_type {
        MessageType::TaskRequest => {
            let label = task_label(&message.payload);
            debug!(%participant, task = %label, message_id = %message.id, "Executing task");
            store.update_agent_status(participant, AgentStatusUpdate::busy(label));

            let started = Instant::now();
            let outcome = worker.execute(message.payload.clone()).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            store.record_task_completion(participant, outcome.is_ok(), elapsed_ms);

            match outcome {
                Ok(result) => {
                    bus.respond_from(participant, &message, result, false).await;
                }
                Err(e) => {
                    warn!(%participant, error = %e, "Task failed");
                    store.update_agent_status(participant, AgentStatusUpdate::new().status(AgentStatus::Error));
                    bus.respond_from(participant, &message, json!({"error": format!("{:#}", e)}), true)
                        .await;
                }
            }
        }
        MessageType::StatusQuery => {
            let status = serde_json::to_value(store.get_agent_context(participant))?;
            bus.respond_from(participant, &message, status, false).await;
        }
        _ => worker.on_event(&message).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LogFilter};
    use crate::context::{Channel, NewTest};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Upper;

    #[async_trait]
    impl Worker for Upper {
        fn participant(&self) -> Participant {
            Participant::Documenter
        }

        async fn execute(&self, task: Value) -> Result<Value> {
            let text = task["text"].as_str().ok_or_else(|| eyre!("missing text"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[derive(Default)]
    struct Watcher {
        events: Mutex<Vec<MessageType>>,
    }

    #[async_trait]
    impl Worker for Watcher {
        fn participant(&self) -> Participant {
            Participant::Analyst
        }

        async fn execute(&self, _task: Value) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn on_event(&self, message: &Message) -> Result<()> {
            self.events.lock().unwrap().push(message.message_type);
            Ok(())
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(MessageBus::default(), ContextStore::new())
    }

    #[tokio::test]
    async fn test_dispatch_records_success() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();

        let result = coord
            .dispatch(Participant::Documenter, json!({"task": "shout", "text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, json!("HI"));

        let agent = coord.store().get_agent_context(Participant::Documenter);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.metrics.tasks_completed, 1);
        assert!(agent.current_task.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_replies_with_error() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();

        let err = coord
            .dispatch(Participant::Documenter, json!({"task": "shout"}))
            .await
            .unwrap_err();
        match err {
            BusError::Remote { message, .. } => assert_eq!(message, "missing text"),
            other => panic!("Expected remote error, got {other:?}"),
        }

        let agent = coord.store().get_agent_context(Participant::Documenter);
        assert_eq!(agent.status, AgentStatus::Error);
        assert_eq!(agent.metrics.tasks_errored, 1);
    }

    #[tokio::test]
    async fn test_busy_status_observed_during_task() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        {
            let statuses = statuses.clone();
            coord.store().subscribe(Channel::Agent, move |_, ctx| {
                let agent = ctx.agent(Participant::Documenter).unwrap();
                statuses.lock().unwrap().push((agent.status, agent.current_task.clone()));
                Ok(())
            });
        }

        coord
            .dispatch(Participant::Documenter, json!({"task": "shout", "text": "x"}))
            .await
            .unwrap();

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                (AgentStatus::Busy, Some("shout".to_string())),
                (AgentStatus::Idle, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();
        assert!(coord.register_worker(Arc::new(Upper)).is_err());
        assert_eq!(coord.registered(), vec![Participant::Documenter]);
        assert_eq!(coord.bus().handler_count(Participant::Documenter), 1);
    }

    #[tokio::test]
    async fn test_unregister_worker_times_out_dispatch() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();
        assert!(coord.unregister_worker(Participant::Documenter));
        assert!(!coord.unregister_worker(Participant::Documenter));

        let err = coord
            .dispatch_with_timeout(Participant::Documenter, json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_announce_reaches_on_event() {
        let mut coord = coordinator();
        let watcher = Arc::new(Watcher::default());
        coord.register_worker(watcher.clone()).unwrap();

        coord.announce(MessageType::DomChanged, json!({"selector": "#cart"})).await;
        coord.announce(MessageType::TestFailed, json!({})).await;

        assert_eq!(
            *watcher.events.lock().unwrap(),
            vec![MessageType::DomChanged, MessageType::TestFailed]
        );
        let log = coord.bus().get_message_log(&LogFilter::new().sent_by(Participant::Coordinator));
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_query_status() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();
        coord.store().start_test(NewTest::new("https://x.test", "x.spec.ts", "x"));
        coord
            .store()
            .record_task_completion(Participant::Documenter, true, 10);

        let status = coord
            .query_status(Participant::Documenter, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status.participant, Participant::Documenter);
        assert_eq!(status.metrics.tasks_completed, 1);
        assert_eq!(coord.bus().handler_count(Participant::Coordinator), 0);

        assert!(
            coord
                .query_status(Participant::TestAuthor, Duration::from_millis(20))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_shutdown_removes_handlers() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Upper)).unwrap();
        coord.register_worker(Arc::new(Watcher::default())).unwrap();
        let bus = coord.bus().clone();

        assert_eq!(coord.shutdown(), 2);
        assert!(coord.registered().is_empty());
        assert_eq!(bus.handler_count(Participant::Documenter), 0);
        assert_eq!(bus.handler_count(Participant::Analyst), 0);

        // Already empty: a second shutdown (and the one on drop) is a no-op
        assert_eq!(coord.shutdown(), 0);
        drop(coord);
        assert_eq!(bus.handler_count(Participant::Coordinator), 0);
    }

    struct Stalled;

    #[async_trait]
    impl Worker for Stalled {
        fn participant(&self) -> Participant {
            Participant::TestAuthor
        }

        async fn execute(&self, _task: Value) -> Result<Value> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_stalled_worker_times_out() {
        let mut coord = coordinator();
        coord.register_worker(Arc::new(Stalled)).unwrap();

        let started = std::time::Instant::now();
        let err = coord
            .dispatch_with_timeout(Participant::TestAuthor, json!({"task": "write"}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 50, .. }));
        assert!(started.elapsed() < Duration::from_secs(1));

        let agent = coord.store().get_agent_context(Participant::TestAuthor);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(coord.bus().metrics().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_cancelled_status_query_leaves_no_listener() {
        let coord = coordinator();

        // Nobody answers; the outer timeout cancels the query before its own deadline
        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            coord.query_status(Participant::Analyst, Duration::from_secs(5)),
        )
        .await;
        assert!(outer.is_err());

        assert_eq!(coord.bus().handler_count(Participant::Coordinator), 0);
        assert_eq!(coord.bus().metrics().pending_requests, 0);
    }

    #[test]
    fn test_coordinator_cannot_be_a_worker() {
        struct Impostor;

        #[async_trait]
        impl Worker for Impostor {
            fn participant(&self) -> Participant {
                Participant::Coordinator
            }

            async fn execute(&self, task: Value) -> Result<Value> {
                Ok(task)
            }
        }

        let mut coord = coordinator();
        assert!(coord.register_worker(Arc::new(Impostor)).is_err());
    }
}
