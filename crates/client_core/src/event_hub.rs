//! Fan-out of service notifications to bound handlers.
//!
//! Handlers are bound per [`Topic`] and receive notifications in the order
//! the service emitted them. A single pump task dispatches, so handlers for
//! one notification finish before the next notification is looked at.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::debug;

use crate::provider::ServiceNotification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    LoginState,
    DirectedMessages,
    FailedDirectedMessages,
    ChannelState,
    Participants,
    MessageLog,
}

pub trait NotificationHandler: Send + Sync {
    fn handle(&self, notification: &ServiceNotification);
}

/// Proof that a handler is bound. Unbinding consumes it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a subscription leaves its handler bound"]
pub struct Subscription {
    id: u64,
    topic: Topic,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Subscriptions owned by one session.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn is_bound(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn take(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
    }
}

struct BoundHandler {
    topic: Topic,
    handler: Arc<dyn NotificationHandler>,
}

pub struct EventHub {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, BoundHandler>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn bind(&self, topic: Topic, handler: Arc<dyn NotificationHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .insert(id, BoundHandler { topic, handler });
        Subscription { id, topic }
    }

    /// Returns false when the handler was already gone.
    pub fn unbind(&self, subscription: Subscription) -> bool {
        self.handlers.lock().remove(&subscription.id).is_some()
    }

    pub fn unbind_all(&self, subscriptions: impl IntoIterator<Item = Subscription>) -> usize {
        let mut handlers = self.handlers.lock();
        subscriptions
            .into_iter()
            .filter(|subscription| handlers.remove(&subscription.id).is_some())
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn count_for(&self, topic: Topic) -> usize {
        self.handlers
            .lock()
            .values()
            .filter(|bound| bound.topic == topic)
            .count()
    }

    /// Delivers one notification to the handlers bound for its topic, in
    /// bind order. Returns how many handlers ran.
    pub fn dispatch(&self, notification: &ServiceNotification) -> usize {
        let topic = notification.topic();
        let targets: Vec<(u64, Arc<dyn NotificationHandler>)> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, bound)| bound.topic == topic)
            .map(|(id, bound)| (*id, Arc::clone(&bound.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in targets {
            // An earlier handler may have unbound this one.
            if !self.handlers.lock().contains_key(&id) {
                continue;
            }
            handler.handle(notification);
            delivered += 1;
        }
        delivered
    }

    pub fn spawn_pump(
        self: &Arc<Self>,
        receiver: mpsc::UnboundedReceiver<ServiceNotification>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut notifications = UnboundedReceiverStream::new(receiver);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let delivered = hub.dispatch(&notification);
                debug!(topic = ?notification.topic(), delivered, "hub: dispatched");
            }
            debug!("hub: notification source closed");
        })
    }
}

#[cfg(test)]
#[path = "tests/event_hub_tests.rs"]
mod tests;
