use std::{collections::VecDeque, fmt, mem, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::domain::{
    ChannelProperty, ChannelRef, ConnectionState, Identity, LoginState, Participant,
    ParticipantKey, RequestId, SubscriptionMode,
};
use token_issuer::Token;
use tokio::sync::mpsc;

use crate::event_hub::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub audio: bool,
    pub text: bool,
    pub switch_transmission: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            audio: true,
            text: true,
            switch_transmission: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTextMessage {
    pub sender: Identity,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectedTextMessage {
    pub sender: Identity,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDirectedMessage {
    pub request_id: RequestId,
}

/// Participant collection of one channel as held by the service.
pub trait RosterSource: Send + Sync + fmt::Debug {
    fn participant(&self, key: &ParticipantKey) -> Option<Participant>;
}

/// FIFO the service fills between notifications. Consumers drain it whole.
#[derive(Debug)]
pub struct NotificationQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for NotificationQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> NotificationQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        mem::take(&mut *self.items.lock()).into()
    }
}

/// Lossless fan-out of service notifications. Every subscriber gets its own
/// unbounded queue, so a slow pump never drops roster changes.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServiceNotification>>>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServiceNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends to every live subscriber and forgets the ones that hung up.
    pub fn publish(&self, notification: ServiceNotification) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Notifications pushed by the service. Payloads carry the roster or queue
/// they refer to, so handlers never have to resolve the sender themselves.
#[derive(Debug, Clone)]
pub enum ServiceNotification {
    LoginStateChanged {
        identity: Identity,
        state: LoginState,
    },
    /// State of `identity`'s own connection to `channel`.
    ChannelPropertyChanged {
        identity: Identity,
        channel: ChannelRef,
        property: ChannelProperty,
        state: ConnectionState,
    },
    ParticipantAdded {
        channel: ChannelRef,
        key: ParticipantKey,
        roster: Arc<dyn RosterSource>,
    },
    /// Fired while the participant is still present in `roster`.
    ParticipantRemoving {
        channel: ChannelRef,
        key: ParticipantKey,
        roster: Arc<dyn RosterSource>,
    },
    ParticipantUpdated {
        channel: ChannelRef,
        key: ParticipantKey,
        participant: Participant,
        property: String,
    },
    GroupMessage {
        channel: ChannelRef,
        message: ChannelTextMessage,
    },
    DirectedMessagesQueued {
        recipient: Identity,
        queue: Arc<NotificationQueue<DirectedTextMessage>>,
    },
    DirectedMessagesFailed {
        sender: Identity,
        queue: Arc<NotificationQueue<FailedDirectedMessage>>,
    },
}

impl ServiceNotification {
    pub fn topic(&self) -> Topic {
        match self {
            Self::LoginStateChanged { .. } => Topic::LoginState,
            Self::ChannelPropertyChanged { .. } => Topic::ChannelState,
            Self::ParticipantAdded { .. }
            | Self::ParticipantRemoving { .. }
            | Self::ParticipantUpdated { .. } => Topic::Participants,
            Self::GroupMessage { .. } => Topic::MessageLog,
            Self::DirectedMessagesQueued { .. } => Topic::DirectedMessages,
            Self::DirectedMessagesFailed { .. } => Topic::FailedDirectedMessages,
        }
    }
}

/// Remote communications service. Each call completes when the service
/// acknowledges it; state changes and traffic arrive through
/// [`CommsProvider::subscribe_notifications`].
#[async_trait]
pub trait CommsProvider: Send + Sync {
    async fn login(&self, identity: &Identity, token: &Token, mode: SubscriptionMode)
        -> Result<()>;
    async fn logout(&self, identity: &Identity) -> Result<()>;
    async fn connect(
        &self,
        identity: &Identity,
        channel: &ChannelRef,
        options: ConnectOptions,
        token: &Token,
    ) -> Result<()>;
    async fn disconnect(&self, identity: &Identity, channel: &ChannelRef) -> Result<()>;
    async fn send_group_text(
        &self,
        identity: &Identity,
        channel: &ChannelRef,
        text: &str,
    ) -> Result<()>;
    /// Returns the request id the service assigned to this send.
    async fn send_directed_text(
        &self,
        sender: &Identity,
        recipient: &Identity,
        text: &str,
    ) -> Result<RequestId>;
    async fn set_input_muted(&self, muted: bool) -> Result<()>;
    fn input_muted(&self) -> bool;
    /// Every notification published after this call, in publish order.
    fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<ServiceNotification>;
}
