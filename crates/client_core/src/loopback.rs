//! In-process communications service.
//!
//! Verifies tokens the same way a real service would, keeps online users and
//! channel rosters in memory, and pushes notifications through the same
//! feed the [`EventHub`](crate::EventHub) pump consumes. Simulated
//! peers are driven with the `peer_*` helpers.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{
    domain::{
        ChannelProperty, ChannelRef, ConnectionState, Identity, LoginState, Participant,
        ParticipantKey, RequestId, SubscriptionMode,
    },
    error::SessionError,
};
use token_issuer::{Token, TokenIssuerConfig, TokenScope, TokenVerifier};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::provider::{
    ChannelTextMessage, CommsProvider, ConnectOptions, DirectedTextMessage,
    FailedDirectedMessage, NotificationFeed, NotificationQueue, RosterSource, ServiceNotification,
};

/// Frozen view of a channel roster attached to a participant notification.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    participants: BTreeMap<ParticipantKey, Participant>,
}

impl RosterSource for RosterSnapshot {
    fn participant(&self, key: &ParticipantKey) -> Option<Participant> {
        self.participants.get(key).cloned()
    }
}

impl RosterSnapshot {
    fn key_of(&self, identity: &Identity) -> Option<ParticipantKey> {
        self.participants
            .values()
            .find(|participant| &participant.identity == identity)
            .map(|participant| participant.key.clone())
    }
}

#[derive(Default)]
struct LoopbackState {
    online: HashSet<Identity>,
    inboxes: HashMap<Identity, Arc<NotificationQueue<DirectedTextMessage>>>,
    failures: HashMap<Identity, Arc<NotificationQueue<FailedDirectedMessage>>>,
    channels: HashMap<ChannelRef, RosterSnapshot>,
    next_key: u64,
}

impl LoopbackState {
    fn inbox(&mut self, identity: &Identity) -> Arc<NotificationQueue<DirectedTextMessage>> {
        Arc::clone(self.inboxes.entry(identity.clone()).or_default())
    }

    fn failures(&mut self, identity: &Identity) -> Arc<NotificationQueue<FailedDirectedMessage>> {
        Arc::clone(self.failures.entry(identity.clone()).or_default())
    }

    /// Adds `identity` to `channel` and returns its key with the roster as it
    /// looks afterwards. An identity already present keeps its key.
    fn add_member(
        &mut self,
        channel: &ChannelRef,
        identity: &Identity,
    ) -> (ParticipantKey, RosterSnapshot, bool) {
        let roster = self.channels.entry(channel.clone()).or_default();
        if let Some(key) = roster.key_of(identity) {
            return (key, roster.clone(), false);
        }
        self.next_key += 1;
        let key = ParticipantKey(format!("participant-{}", self.next_key));
        roster
            .participants
            .insert(key.clone(), Participant::new(key.clone(), identity.clone()));
        (key, roster.clone(), true)
    }

    /// Removes `identity` from `channel` and returns its key with the roster
    /// as it looked before removal.
    fn remove_member(
        &mut self,
        channel: &ChannelRef,
        identity: &Identity,
    ) -> Option<(ParticipantKey, RosterSnapshot)> {
        let roster = self.channels.get_mut(channel)?;
        let key = roster.key_of(identity)?;
        let before = roster.clone();
        roster.participants.remove(&key);
        if roster.participants.is_empty() {
            self.channels.remove(channel);
        }
        Some((key, before))
    }

    fn channels_of(&self, identity: &Identity) -> Vec<ChannelRef> {
        self.channels
            .iter()
            .filter(|(_, roster)| roster.key_of(identity).is_some())
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

pub struct LoopbackProvider {
    verifier: TokenVerifier,
    notifications: NotificationFeed,
    state: Mutex<LoopbackState>,
    input_muted: AtomicBool,
}

impl LoopbackProvider {
    pub fn new(cfg: &TokenIssuerConfig) -> Result<Self, SessionError> {
        Ok(Self {
            verifier: TokenVerifier::new(cfg)?,
            notifications: NotificationFeed::new(),
            state: Mutex::new(LoopbackState::default()),
            input_muted: AtomicBool::new(false),
        })
    }

    fn notify(&self, notification: ServiceNotification) {
        self.notifications.publish(notification);
    }

    fn verify(&self, token: &Token, scope: TokenScope) -> Result<()> {
        self.verifier
            .verify(token, &scope)
            .map(|_| ())
            .map_err(|err| anyhow!(err))
    }

    fn announce_added(&self, channel: &ChannelRef, key: ParticipantKey, roster: RosterSnapshot) {
        self.notify(ServiceNotification::ParticipantAdded {
            channel: channel.clone(),
            key,
            roster: Arc::new(roster),
        });
    }

    fn announce_removing(&self, channel: &ChannelRef, key: ParticipantKey, roster: RosterSnapshot) {
        self.notify(ServiceNotification::ParticipantRemoving {
            channel: channel.clone(),
            key,
            roster: Arc::new(roster),
        });
    }

    fn announce_channel_state(
        &self,
        identity: &Identity,
        channel: &ChannelRef,
        property: ChannelProperty,
        state: ConnectionState,
    ) {
        self.notify(ServiceNotification::ChannelPropertyChanged {
            identity: identity.clone(),
            channel: channel.clone(),
            property,
            state,
        });
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.state.lock().online.contains(identity)
    }

    pub fn participants(&self, channel: &ChannelRef) -> Vec<Participant> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|roster| roster.participants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Brings a simulated user online and into `channel`.
    pub fn connect_peer(&self, peer: &Identity, channel: &ChannelRef) -> ParticipantKey {
        let (key, roster, added) = {
            let mut state = self.state.lock();
            state.online.insert(peer.clone());
            state.inbox(peer);
            state.add_member(channel, peer)
        };
        if added {
            info!(peer = peer.username(), channel = channel.name(), "loopback: peer joined");
            self.announce_added(channel, key.clone(), roster);
        }
        key
    }

    /// Takes a simulated user out of `channel` and offline. Returns false
    /// when the peer was not in the channel.
    pub fn disconnect_peer(&self, peer: &Identity, channel: &ChannelRef) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove_member(channel, peer);
            if state.channels_of(peer).is_empty() {
                state.online.remove(peer);
            }
            removed
        };
        match removed {
            Some((key, before)) => {
                info!(peer = peer.username(), channel = channel.name(), "loopback: peer left");
                self.announce_removing(channel, key, before);
                true
            }
            None => false,
        }
    }

    pub fn peer_says(&self, peer: &Identity, channel: &ChannelRef, text: &str) {
        self.notify(ServiceNotification::GroupMessage {
            channel: channel.clone(),
            message: ChannelTextMessage {
                sender: peer.clone(),
                text: text.to_string(),
            },
        });
    }

    /// Queues a directed message without telling the recipient yet.
    pub fn enqueue_directed(&self, peer: &Identity, recipient: &Identity, text: &str) {
        self.state.lock().inbox(recipient).push(DirectedTextMessage {
            sender: peer.clone(),
            text: text.to_string(),
        });
    }

    /// Signals the recipient that its directed-message queue has items.
    pub fn flush_directed(&self, recipient: &Identity) {
        let queue = self.state.lock().inbox(recipient);
        self.notify(ServiceNotification::DirectedMessagesQueued {
            recipient: recipient.clone(),
            queue,
        });
    }

    pub fn peer_sends_directed(&self, peer: &Identity, recipient: &Identity, text: &str) {
        self.enqueue_directed(peer, recipient, text);
        self.flush_directed(recipient);
    }

    pub fn peer_set_muted(&self, peer: &Identity, channel: &ChannelRef, muted: bool) -> bool {
        let updated = {
            let mut state = self.state.lock();
            state.channels.get_mut(channel).and_then(|roster| {
                let key = roster.key_of(peer)?;
                let participant = roster.participants.get_mut(&key)?;
                participant.is_muted = muted;
                Some((key, participant.clone()))
            })
        };
        match updated {
            Some((key, participant)) => {
                self.notify(ServiceNotification::ParticipantUpdated {
                    channel: channel.clone(),
                    key,
                    participant,
                    property: "is_muted".to_string(),
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CommsProvider for LoopbackProvider {
    async fn login(&self, identity: &Identity, token: &Token, mode: SubscriptionMode) -> Result<()> {
        self.verify(
            token,
            TokenScope::Login {
                identity: identity.clone(),
            },
        )?;
        {
            let mut state = self.state.lock();
            state.online.insert(identity.clone());
            state.inbox(identity);
            state.failures(identity);
        }
        debug!(username = identity.username(), ?mode, "loopback: login accepted");
        self.notify(ServiceNotification::LoginStateChanged {
            identity: identity.clone(),
            state: LoginState::LoggedIn,
        });
        Ok(())
    }

    async fn logout(&self, identity: &Identity) -> Result<()> {
        let departures = {
            let mut state = self.state.lock();
            if !state.online.remove(identity) {
                bail!("{} is not logged in", identity.username());
            }
            state
                .channels_of(identity)
                .into_iter()
                .filter_map(|channel| {
                    state
                        .remove_member(&channel, identity)
                        .map(|(key, before)| (channel, key, before))
                })
                .collect::<Vec<_>>()
        };
        for (channel, key, before) in departures {
            self.announce_removing(&channel, key, before);
        }
        self.notify(ServiceNotification::LoginStateChanged {
            identity: identity.clone(),
            state: LoginState::LoggedOut,
        });
        Ok(())
    }

    async fn connect(
        &self,
        identity: &Identity,
        channel: &ChannelRef,
        options: ConnectOptions,
        token: &Token,
    ) -> Result<()> {
        self.verify(
            token,
            TokenScope::Join {
                identity: identity.clone(),
                channel: channel.clone(),
            },
        )?;
        let (joined, roster, added) = {
            let mut state = self.state.lock();
            if !state.online.contains(identity) {
                bail!("{} is not logged in", identity.username());
            }
            state.add_member(channel, identity)
        };

        if options.text {
            self.announce_channel_state(identity, channel, ChannelProperty::TextState, ConnectionState::Connected);
        }
        if options.audio {
            self.announce_channel_state(identity, channel, ChannelProperty::AudioState, ConnectionState::Connected);
        }
        self.announce_channel_state(identity, channel, ChannelProperty::ChannelState, ConnectionState::Connected);
        if added {
            // Members already present learn about the joiner; the joiner also
            // gets everyone else. Rosters skip keys they already hold.
            self.announce_added(channel, joined.clone(), roster.clone());
            for key in roster.participants.keys().filter(|key| **key != joined) {
                self.announce_added(channel, key.clone(), roster.clone());
            }
        }
        Ok(())
    }

    async fn disconnect(&self, identity: &Identity, channel: &ChannelRef) -> Result<()> {
        let removed = self.state.lock().remove_member(channel, identity);
        let Some((key, before)) = removed else {
            bail!("{} is not in {}", identity.username(), channel.name());
        };
        self.announce_removing(channel, key, before);
        self.announce_channel_state(identity, channel, ChannelProperty::ChannelState, ConnectionState::Disconnected);
        Ok(())
    }

    async fn send_group_text(&self, identity: &Identity, channel: &ChannelRef, text: &str) -> Result<()> {
        let joined = self
            .state
            .lock()
            .channels
            .get(channel)
            .is_some_and(|roster| roster.key_of(identity).is_some());
        if !joined {
            bail!("{} is not in {}", identity.username(), channel.name());
        }
        self.notify(ServiceNotification::GroupMessage {
            channel: channel.clone(),
            message: ChannelTextMessage {
                sender: identity.clone(),
                text: text.to_string(),
            },
        });
        Ok(())
    }

    async fn send_directed_text(&self, sender: &Identity, recipient: &Identity, text: &str) -> Result<RequestId> {
        let request_id = RequestId(Uuid::new_v4().to_string());
        let notification = {
            let mut state = self.state.lock();
            if !state.online.contains(sender) {
                bail!("{} is not logged in", sender.username());
            }
            if state.online.contains(recipient) {
                let queue = state.inbox(recipient);
                queue.push(DirectedTextMessage {
                    sender: sender.clone(),
                    text: text.to_string(),
                });
                ServiceNotification::DirectedMessagesQueued {
                    recipient: recipient.clone(),
                    queue,
                }
            } else {
                let queue = state.failures(sender);
                queue.push(FailedDirectedMessage {
                    request_id: request_id.clone(),
                });
                ServiceNotification::DirectedMessagesFailed {
                    sender: sender.clone(),
                    queue,
                }
            }
        };
        self.notify(notification);
        Ok(request_id)
    }

    async fn set_input_muted(&self, muted: bool) -> Result<()> {
        self.input_muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn input_muted(&self) -> bool {
        self.input_muted.load(Ordering::SeqCst)
    }

    fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<ServiceNotification> {
        self.notifications.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
