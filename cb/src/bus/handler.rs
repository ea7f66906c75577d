//! Handler registration for the MessageBus

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use eyre::Result;
use tracing::debug;

use crate::participant::Participant;

use super::messages::Message;

/// Receives messages delivered to a participant
///
/// Returning an error is a local failure: the bus logs it and keeps delivering
/// to the remaining handlers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into a `MessageHandler`
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Ordered handler lists keyed by registration token
///
/// Tokens increase monotonically, so iterating a participant's map yields
/// handlers in registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<Participant, BTreeMap<u64, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn insert(&mut self, participant: Participant, handler: Arc<dyn MessageHandler>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers.entry(participant).or_default().insert(id, handler);
        id
    }

    pub(crate) fn remove(&mut self, participant: Participant, id: u64) -> bool {
        self.handlers
            .get_mut(&participant)
            .is_some_and(|handlers| handlers.remove(&id).is_some())
    }

    /// Snapshot of a participant's handlers in registration order
    pub(crate) fn snapshot(&self, participant: Participant) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&participant)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, participant: Participant) -> usize {
        self.handlers.get(&participant).map_or(0, BTreeMap::len)
    }
}

/// Registration token returned by `MessageBus::subscribe`
///
/// Dropping a `Subscription` leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    registry: Weak<Mutex<HandlerRegistry>>,
    participant: Participant,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<Mutex<HandlerRegistry>>, participant: Participant, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            participant,
            id,
        }
    }

    /// The participant this handler receives messages for
    pub fn participant(&self) -> Participant {
        self.participant
    }

    /// Remove exactly this registration
    ///
    /// Returns true if the handler was still registered; calling it again is a no-op.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.participant, self.id);
        debug!(participant = %self.participant, id = self.id, removed, "Subscription::unsubscribe");
        removed
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("next_id", &self.next_id)
            .field("participants", &self.handlers.len())
            .finish()
    }
}
