//! MessageBus implementation

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::participant::{Participant, Recipient};

use super::config::BusConfig;
use super::handler::{FnHandler, HandlerRegistry, MessageHandler, Subscription};
use super::messages::{
    BusError, BusMetrics, BusResult, LogFilter, Message, MessageType, OutgoingMessage, describe_error_payload,
};

/// Lock a mutex, recovering the data if a previous holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BusInner {
    config: BusConfig,
    registry: Arc<Mutex<HandlerRegistry>>,
    log: Mutex<VecDeque<Message>>,
    metrics: Mutex<BusMetrics>,
}

/// An in-flight request; dropping it removes the transient reply listener
struct PendingRequest<'a> {
    bus: &'a MessageBus,
    listener: Subscription,
}

impl<'a> PendingRequest<'a> {
    fn new(bus: &'a MessageBus, listener: Subscription) -> Self {
        let mut metrics = lock(&bus.inner.metrics);
        metrics.requests_sent += 1;
        metrics.pending_requests += 1;
        drop(metrics);
        Self { bus, listener }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.listener.unsubscribe();
        let mut metrics = lock(&self.bus.inner.metrics);
        metrics.pending_requests = metrics.pending_requests.saturating_sub(1);
    }
}

/// Routes typed messages between the fixed set of participants
///
/// Cloning is cheap and every clone shares the same handlers, log and metrics.
/// Delivery is sequential: each handler is awaited before the next one runs, and
/// broadcast visits recipients in `Participant::ALL` order. A request is logged in the
/// caller's context and delivered on a spawned task, so its deadline holds even while
/// the recipient's handlers are still running.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a new bus with the given configuration
    pub fn new(config: BusConfig) -> Self {
        debug!(?config, "MessageBus::new: called");
        Self {
            inner: Arc::new(BusInner {
                log: Mutex::new(VecDeque::with_capacity(config.max_log_entries.min(1024))),
                config,
                registry: Arc::new(Mutex::new(HandlerRegistry::default())),
                metrics: Mutex::new(BusMetrics::default()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register an async closure to receive messages addressed to `participant`
    pub fn subscribe<F, Fut>(&self, participant: Participant, handler: F) -> Subscription
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(participant, Arc::new(FnHandler(handler)))
    }

    /// Register a `MessageHandler` implementation for `participant`
    pub fn subscribe_handler(&self, participant: Participant, handler: Arc<dyn MessageHandler>) -> Subscription {
        let id = lock(&self.inner.registry).insert(participant, handler);
        debug!(%participant, id, "MessageBus::subscribe: registered handler");
        Subscription::new(&self.inner.registry, participant, id)
    }

    /// Number of handlers currently registered for `participant`
    pub fn handler_count(&self, participant: Participant) -> usize {
        lock(&self.inner.registry).count(participant)
    }

    /// Stamp, log and deliver a message
    ///
    /// Handler failures are logged and counted; they never abort the publish.
    /// Returns the message as it was logged.
    pub async fn publish(&self, outgoing: OutgoingMessage) -> Message {
        let message = self.log_message(outgoing);
        self.route(&message).await;
        message
    }

    /// Stamp a message, append it to the log and count it
    fn log_message(&self, outgoing: OutgoingMessage) -> Message {
        let message = outgoing.stamp();
        debug!(
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            message_type = %message.message_type,
            "MessageBus::publish: called"
        );

        self.append_to_log(message.clone());
        lock(&self.inner.metrics).messages_published += 1;
        message
    }

    /// Deliver a recorded message to its recipients
    async fn route(&self, message: &Message) {
        match message.to {
            Recipient::Broadcast => {
                for participant in Participant::ALL {
                    if participant != message.from {
                        self.deliver(participant, message).await;
                    }
                }
            }
            Recipient::Participant(participant) => {
                self.deliver(participant, message).await;
            }
        }
    }

    fn append_to_log(&self, message: Message) {
        let max = self.inner.config.max_log_entries;
        let mut log = lock(&self.inner.log);
        log.push_back(message);
        while log.len() > max {
            log.pop_front();
        }
    }

    /// Invoke every handler of `recipient` in registration order
    async fn deliver(&self, recipient: Participant, message: &Message) {
        let handlers = lock(&self.inner.registry).snapshot(recipient);
        if handlers.is_empty() {
            debug!(%recipient, message_id = %message.id, "MessageBus::deliver: no handlers");
            return;
        }

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(message.clone())).catch_unwind().await;
            let mut metrics = lock(&self.inner.metrics);
            match outcome {
                Ok(Ok(())) => metrics.deliveries += 1,
                Ok(Err(e)) => {
                    metrics.handler_failures += 1;
                    warn!(
                        %recipient,
                        message_id = %message.id,
                        message_type = %message.message_type,
                        error = %e,
                        "Message handler failed"
                    );
                }
                Err(_) => {
                    metrics.handler_failures += 1;
                    warn!(
                        %recipient,
                        message_id = %message.id,
                        message_type = %message.message_type,
                        "Message handler panicked"
                    );
                }
            }
        }
    }

    /// Send a `task:request` and wait for the matching response, using the configured timeout
    pub async fn request(&self, from: Participant, to: impl Into<Recipient>, payload: Value) -> BusResult<Value> {
        let timeout = self.inner.config.request_timeout();
        self.request_with_timeout(from, to, payload, timeout).await
    }

    /// Like [`request`](Self::request), deserializing the response payload into `T`
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        from: Participant,
        to: impl Into<Recipient>,
        payload: Value,
    ) -> BusResult<T> {
        let value = self.request(from, to, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`request_with_timeout`](Self::request_with_timeout), deserializing the response payload into `T`
    pub async fn request_as_with_timeout<T: DeserializeOwned>(
        &self,
        from: Participant,
        to: impl Into<Recipient>,
        payload: Value,
        timeout: Duration,
    ) -> BusResult<T> {
        let value = self.request_with_timeout(from, to, payload, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a `task:request` and wait up to `timeout` for the matching reply
    ///
    /// Replies are matched solely by correlation id. A `task:response` resolves with its
    /// payload, a `task:error` fails with [`BusError::Remote`], and an elapsed deadline fails
    /// with [`BusError::Timeout`]. The deadline runs from the call and covers delivery of the
    /// request: a handler slower than the deadline keeps running, but its reply reaches no
    /// listener. The transient listener on `from` is removed on every path.
    pub async fn request_with_timeout(
        &self,
        from: Participant,
        to: impl Into<Recipient>,
        payload: Value,
        timeout: Duration,
    ) -> BusResult<Value> {
        self.request_typed(from, to.into(), MessageType::TaskRequest, payload, timeout)
            .await
    }

    /// Send a message of `message_type` and settle on its correlated reply
    ///
    /// Delivery runs on its own task so the deadline is enforced however long the
    /// recipient's handlers take.
    pub(crate) async fn request_typed(
        &self,
        from: Participant,
        to: Recipient,
        message_type: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> BusResult<Value> {
        let deadline = Instant::now() + timeout;
        let correlation_id = Uuid::now_v7().to_string();
        debug!(%from, %to, %message_type, %correlation_id, ?timeout, "MessageBus::request: called");

        let (reply_tx, reply_rx) = oneshot::channel::<Message>();
        let reply_slot = Arc::new(Mutex::new(Some(reply_tx)));
        let expected = correlation_id.clone();
        let listener = self.subscribe(from, move |message: Message| {
            let reply_slot = reply_slot.clone();
            let expected = expected.clone();
            async move {
                if message.message_type.is_reply()
                    && message.correlation_id.as_deref() == Some(expected.as_str())
                    && let Some(tx) = lock(&reply_slot).take()
                {
                    let _ = tx.send(message);
                }
                Ok(())
            }
        });
        let pending = PendingRequest::new(self, listener);

        let request =
            self.log_message(OutgoingMessage::new(from, to, message_type, payload).with_correlation_id(&correlation_id));
        let bus = self.clone();
        tokio::spawn(async move { bus.route(&request).await });

        let outcome = tokio::time::timeout_at(deadline, reply_rx).await;
        drop(pending);

        let mut metrics = lock(&self.inner.metrics);
        match outcome {
            Ok(Ok(reply)) if reply.message_type == MessageType::TaskError => {
                metrics.remote_errors += 1;
                let message = describe_error_payload(&reply.payload);
                debug!(%to, %correlation_id, %message, "MessageBus::request: remote error");
                Err(BusError::Remote {
                    target: to,
                    message,
                    payload: reply.payload,
                })
            }
            Ok(Ok(reply)) => {
                debug!(%to, %correlation_id, "MessageBus::request: resolved");
                Ok(reply.payload)
            }
            Ok(Err(_)) => Err(BusError::Closed(correlation_id)),
            Err(_) => {
                metrics.request_timeouts += 1;
                warn!(%from, %to, %correlation_id, ?timeout, "Request timed out");
                Err(BusError::Timeout {
                    target: to,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Reply to `original`, swapping its sender and recipient
    ///
    /// The reply carries the original's correlation id, or its message id when the
    /// original was not sent through [`request`](Self::request). A message addressed to
    /// `broadcast` has no single recipient to reply as; use
    /// [`respond_from`](Self::respond_from) for those.
    pub async fn respond(&self, original: &Message, payload: Value, is_error: bool) -> BusResult<Message> {
        let responder = original
            .to
            .participant()
            .ok_or_else(|| BusError::UnroutableReply(original.id.clone()))?;
        Ok(self.respond_from(responder, original, payload, is_error).await)
    }

    /// Reply to `original` as `responder`
    pub async fn respond_from(&self, responder: Participant, original: &Message, payload: Value, is_error: bool) -> Message {
        let message_type = if is_error {
            MessageType::TaskError
        } else {
            MessageType::TaskResponse
        };
        let correlation_id = original.correlation_id.clone().unwrap_or_else(|| original.id.clone());
        debug!(%responder, to = %original.from, %correlation_id, %message_type, "MessageBus::respond: called");

        self.publish(OutgoingMessage::new(responder, original.from, message_type, payload).with_correlation_id(correlation_id))
            .await
    }

    /// Snapshot of the log, oldest first, filtered by every criterion in `filter`
    pub fn get_message_log(&self, filter: &LogFilter) -> Vec<Message> {
        lock(&self.inner.log)
            .iter()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect()
    }

    /// Number of messages currently retained
    pub fn log_len(&self) -> usize {
        lock(&self.inner.log).len()
    }

    pub fn clear_log(&self) {
        let mut log = lock(&self.inner.log);
        info!(cleared = log.len(), "Message log cleared");
        log.clear();
    }

    pub fn metrics(&self) -> BusMetrics {
        lock(&self.inner.metrics).clone()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
