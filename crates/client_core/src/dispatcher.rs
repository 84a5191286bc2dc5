use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::{ChannelRef, Identity, RequestId},
    error::{ErrorReport, RemoteOperation, SessionError},
    protocol::{ClientEvent, IncomingMessage},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    event_hub::NotificationHandler,
    operation::PendingOperation,
    provider::{
        ChannelTextMessage, CommsProvider, DirectedTextMessage, FailedDirectedMessage,
        NotificationQueue, ServiceNotification,
    },
};

/// Failure reports may overtake the send completion that registers their
/// request id. This many early ids are remembered.
const MAX_EARLY_FAILURES: usize = 64;

#[derive(Debug, Clone)]
struct PendingDirected {
    recipient: String,
    text: String,
}

#[derive(Default)]
struct DispatcherState {
    pending: HashMap<RequestId, PendingDirected>,
    early_failures: VecDeque<RequestId>,
}

pub struct MessageDispatcher {
    identity: Identity,
    provider: Arc<dyn CommsProvider>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<DispatcherState>,
}

impl MessageDispatcher {
    pub fn new(
        identity: Identity,
        provider: Arc<dyn CommsProvider>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity,
            provider,
            events,
            state: Mutex::new(DispatcherState::default()),
        }
    }

    /// At most one delivery attempt; failures are reported, never retried.
    pub fn send_group(&self, channel: ChannelRef, text: String) -> PendingOperation {
        let provider = Arc::clone(&self.provider);
        let events = self.events.clone();
        let identity = self.identity.clone();
        PendingOperation::spawn(RemoteOperation::SendGroup, async move {
            provider
                .send_group_text(&identity, &channel, &text)
                .await
                .map_err(|err| {
                    let err = SessionError::remote(RemoteOperation::SendGroup, err);
                    warn!(channel = channel.name(), "dispatch: {err}");
                    let _ = events.send(ClientEvent::Error(ErrorReport::from(&err)));
                    err
                })
        })
    }

    pub fn send_directed(
        self: &Arc<Self>,
        recipient: Identity,
        text: String,
    ) -> PendingOperation<RequestId> {
        let dispatcher = Arc::clone(self);
        PendingOperation::spawn(RemoteOperation::SendDirected, async move {
            let request_id = match dispatcher
                .provider
                .send_directed_text(&dispatcher.identity, &recipient, &text)
                .await
            {
                Ok(request_id) => request_id,
                Err(err) => {
                    let err = SessionError::remote(RemoteOperation::SendDirected, err);
                    warn!(recipient = recipient.username(), "dispatch: {err}");
                    let _ = dispatcher
                        .events
                        .send(ClientEvent::Error(ErrorReport::from(&err)));
                    return Err(err);
                }
            };

            info!(
                request_id = %request_id,
                "To {}: {}",
                recipient.username(),
                text
            );
            let _ = dispatcher.events.send(ClientEvent::DirectedMessageSent {
                request_id: request_id.clone(),
                recipient: recipient.username().to_string(),
                text: text.clone(),
            });
            dispatcher.record_pending(request_id.clone(), recipient.username().to_string(), text);
            Ok(request_id)
        })
    }

    fn record_pending(&self, request_id: RequestId, recipient: String, text: String) {
        let already_failed = {
            let mut state = self.state.lock();
            match state.early_failures.iter().position(|id| id == &request_id) {
                Some(index) => {
                    state.early_failures.remove(index);
                    true
                }
                None => {
                    state
                        .pending
                        .insert(request_id.clone(), PendingDirected { recipient, text: text.clone() });
                    false
                }
            }
        };

        if already_failed {
            self.emit_send_failed(&request_id, text);
        }
    }

    /// Resolves a failure report against the send that produced it. The
    /// entry is consumed, so a repeated report for the same id finds nothing.
    pub fn report_failure(&self, request_id: &RequestId) -> Result<String, SessionError> {
        let resolved = {
            let mut state = self.state.lock();
            let resolved = state.pending.remove(request_id);
            if resolved.is_none() {
                if state.early_failures.len() == MAX_EARLY_FAILURES {
                    state.early_failures.pop_front();
                }
                state.early_failures.push_back(request_id.clone());
            }
            resolved
        };

        let pending = resolved.ok_or_else(|| SessionError::UnknownRequestId {
            request_id: request_id.clone(),
        })?;
        debug!(request_id = %request_id, recipient = %pending.recipient, "dispatch: directed send failed");
        self.emit_send_failed(request_id, pending.text.clone());
        Ok(pending.text)
    }

    fn emit_send_failed(&self, request_id: &RequestId, text: String) {
        info!(request_id = %request_id, "Message Failed to Send: {text}");
        let _ = self
            .events
            .send(ClientEvent::SendFailed { original_text: text });
    }

    /// Delivers every queued directed message, oldest first.
    pub fn drain_directed(&self, queue: &NotificationQueue<DirectedTextMessage>) -> usize {
        let messages = queue.drain();
        let count = messages.len();
        for message in messages {
            debug!(sender = message.sender.username(), "dispatch: directed message received");
            let _ = self.events.send(ClientEvent::MessageReceived(IncomingMessage {
                sender_name: message.sender.username().to_string(),
                text: message.text,
                is_directed: true,
                channel: None,
            }));
        }
        count
    }

    /// Correlates every queued failure record. Unknown ids are dropped.
    pub fn drain_failures(&self, queue: &NotificationQueue<FailedDirectedMessage>) -> usize {
        let mut reported = 0;
        for failed in queue.drain() {
            match self.report_failure(&failed.request_id) {
                Ok(_) => reported += 1,
                Err(err) => debug!("dispatch: {err}"),
            }
        }
        reported
    }

    pub fn deliver_group(&self, channel: &ChannelRef, message: &ChannelTextMessage) {
        let sender_name = message.sender.username();
        info!(channel = channel.name(), "From {sender_name} : {}", message.text);
        let _ = self.events.send(ClientEvent::MessageReceived(IncomingMessage {
            sender_name: sender_name.to_string(),
            text: message.text.clone(),
            is_directed: false,
            channel: Some(channel.name().to_string()),
        }));
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn clear_pending(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.early_failures.clear();
    }
}

impl NotificationHandler for MessageDispatcher {
    fn handle(&self, notification: &ServiceNotification) {
        match notification {
            ServiceNotification::DirectedMessagesQueued { recipient, queue }
                if recipient == &self.identity =>
            {
                self.drain_directed(queue);
            }
            ServiceNotification::DirectedMessagesFailed { sender, queue }
                if sender == &self.identity =>
            {
                self.drain_failures(queue);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
