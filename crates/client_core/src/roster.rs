use std::collections::HashMap;

use parking_lot::Mutex;
use shared::{
    domain::{ChannelRef, Identity, Participant, ParticipantKey},
    error::SessionError,
    protocol::{ClientEvent, RosterChange},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    event_hub::NotificationHandler,
    provider::{RosterSource, ServiceNotification},
};

/// Currently joined remote participants, keyed by participant key.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    participants: HashMap<ParticipantKey, Participant>,
}

impl Roster {
    pub fn get(&self, key: &ParticipantKey) -> Option<&Participant> {
        self.participants.get(key)
    }

    pub fn contains_key(&self, key: &ParticipantKey) -> bool {
        self.participants.contains_key(key)
    }

    pub fn contains_username(&self, username: &str) -> bool {
        self.participants
            .values()
            .any(|participant| participant.username() == username)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    fn insert(&mut self, participant: Participant) {
        self.participants.insert(participant.key.clone(), participant);
    }

    fn get_mut(&mut self, key: &ParticipantKey) -> Option<&mut Participant> {
        self.participants.get_mut(key)
    }

    fn remove(&mut self, key: &ParticipantKey) -> Option<Participant> {
        self.participants.remove(key)
    }

    fn clear(&mut self) {
        self.participants.clear();
    }
}

#[derive(Default)]
struct RosterState {
    roster: Roster,
    local: Option<Participant>,
    selectable: Vec<String>,
}

/// Applies participant notifications for one channel to the local roster.
pub struct RosterSynchronizer {
    channel: ChannelRef,
    local_identity: Identity,
    state: Mutex<RosterState>,
    events: broadcast::Sender<ClientEvent>,
}

impl RosterSynchronizer {
    pub fn new(
        channel: ChannelRef,
        local_identity: Identity,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            channel,
            local_identity,
            state: Mutex::new(RosterState::default()),
            events,
        }
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn participant_added(
        &self,
        key: &ParticipantKey,
        source: &dyn RosterSource,
    ) -> Result<(), SessionError> {
        let participant = source
            .participant(key)
            .filter(|participant| &participant.key == key)
            .ok_or_else(|| SessionError::MissingParticipant { key: key.clone() })?;
        let username = participant.username().to_string();

        {
            let mut state = self.state.lock();
            let known = state.roster.contains_key(key)
                || state.local.as_ref().is_some_and(|local| &local.key == key);
            if known {
                debug!(channel = self.channel.name(), username = %username, "roster: already present");
                return Ok(());
            }
            if participant.identity == self.local_identity {
                state.local = Some(participant);
            } else {
                if !state.selectable.contains(&username) {
                    state.selectable.push(username.clone());
                }
                state.roster.insert(participant);
            }
        }

        info!(channel = self.channel.name(), username = %username, "{username} has joined the channel");
        let _ = self.events.send(ClientEvent::RosterChanged {
            channel: self.channel.name().to_string(),
            username,
            change: RosterChange::Joined,
        });
        Ok(())
    }

    /// Must run before the service drops `key` from `source`. A key this
    /// roster never admitted is ignored.
    pub fn participant_removing(
        &self,
        key: &ParticipantKey,
        source: &dyn RosterSource,
    ) -> Result<(), SessionError> {
        let removed = {
            let mut state = self.state.lock();
            if state.local.as_ref().is_some_and(|local| &local.key == key) {
                state.local.take()
            } else {
                let removed = state.roster.remove(key);
                if let Some(participant) = &removed {
                    let username = participant.username();
                    if !state.roster.contains_username(username) {
                        state.selectable.retain(|selectable| selectable != username);
                    }
                }
                removed
            }
        };

        let Some(removed) = removed else {
            let participant = source
                .participant(key)
                .ok_or_else(|| SessionError::MissingParticipant { key: key.clone() })?;
            debug!(
                channel = self.channel.name(),
                username = participant.username(),
                "roster: removal for a participant never admitted"
            );
            return Ok(());
        };
        let username = removed.username().to_string();

        info!(channel = self.channel.name(), username = %username, "{username} has left channel");
        let _ = self.events.send(ClientEvent::RosterChanged {
            channel: self.channel.name().to_string(),
            username,
            change: RosterChange::Left,
        });
        Ok(())
    }

    /// Copies flags from `updated` onto the entry for `key`. Membership is
    /// left untouched.
    pub fn participant_updated(
        &self,
        key: &ParticipantKey,
        updated: &Participant,
        property: &str,
    ) -> Result<(), SessionError> {
        if &updated.key != key {
            return Err(SessionError::MissingParticipant { key: key.clone() });
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = match state.roster.get_mut(key) {
            Some(participant) => participant,
            None => state
                .local
                .as_mut()
                .filter(|local| &local.key == key)
                .ok_or_else(|| SessionError::MissingParticipant { key: key.clone() })?,
        };
        target.is_muted = updated.is_muted;
        target.is_speaking = updated.is_speaking;
        debug!(
            channel = self.channel.name(),
            username = target.username(),
            property,
            "roster: participant updated"
        );
        Ok(())
    }

    pub fn get(&self, key: &ParticipantKey) -> Option<Participant> {
        self.state.lock().roster.get(key).cloned()
    }

    pub fn snapshot(&self) -> Roster {
        self.state.lock().roster.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().roster.is_empty()
    }

    pub fn contains_username(&self, username: &str) -> bool {
        self.state.lock().roster.contains_username(username)
    }

    pub fn local_participant(&self) -> Option<Participant> {
        self.state.lock().local.clone()
    }

    /// Remote usernames in join order, for picking a directed-message target.
    pub fn selectable_users(&self) -> Vec<String> {
        self.state.lock().selectable.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.roster.clear();
        state.local = None;
        state.selectable.clear();
    }
}

impl NotificationHandler for RosterSynchronizer {
    fn handle(&self, notification: &ServiceNotification) {
        let result = match notification {
            ServiceNotification::ParticipantAdded {
                channel,
                key,
                roster,
            } if channel == &self.channel => self.participant_added(key, roster.as_ref()),
            ServiceNotification::ParticipantRemoving {
                channel,
                key,
                roster,
            } if channel == &self.channel => self.participant_removing(key, roster.as_ref()),
            ServiceNotification::ParticipantUpdated {
                channel,
                key,
                participant,
                property,
            } if channel == &self.channel => self.participant_updated(key, participant, property),
            _ => Ok(()),
        };

        if let Err(err) = result {
            warn!(channel = self.channel.name(), "roster: dropped notification: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
