use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use shared::{
    domain::{ChannelProperty, ChannelRef, ConnectionState, Identity},
    error::{ErrorReport, RemoteOperation, SessionError},
    protocol::{channel_phase, ClientEvent},
};
use token_issuer::Token;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::MessageDispatcher,
    event_hub::{NotificationHandler, SubscriptionSet, Topic},
    operation::PendingOperation,
    provider::{ConnectOptions, ServiceNotification},
    roster::RosterSynchronizer,
    SessionContext,
};

#[derive(Default)]
struct ChannelInner {
    text: ConnectionState,
    audio: ConnectionState,
    overall: ConnectionState,
    subscriptions: SubscriptionSet,
    attempt: Option<CancellationToken>,
}

impl ChannelInner {
    fn get(&self, property: ChannelProperty) -> ConnectionState {
        match property {
            ChannelProperty::TextState => self.text,
            ChannelProperty::AudioState => self.audio,
            ChannelProperty::ChannelState => self.overall,
        }
    }

    fn slot(&mut self, property: ChannelProperty) -> &mut ConnectionState {
        match property {
            ChannelProperty::TextState => &mut self.text,
            ChannelProperty::AudioState => &mut self.audio,
            ChannelProperty::ChannelState => &mut self.overall,
        }
    }
}

/// Connection state machine for one channel joined by a login session.
///
/// Text and audio legs move independently; `ChannelState` tracks overall
/// presence. Participant and message-log handlers stay bound from the
/// start of a join until leave, failure, or a service-side disconnect.
pub struct ChannelSession {
    channel: ChannelRef,
    identity: Identity,
    options: ConnectOptions,
    ctx: SessionContext,
    roster: Arc<RosterSynchronizer>,
    dispatcher: Arc<MessageDispatcher>,
    inner: Mutex<ChannelInner>,
}

impl ChannelSession {
    pub(crate) fn new(
        channel: ChannelRef,
        identity: Identity,
        options: ConnectOptions,
        ctx: SessionContext,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Arc<Self> {
        let roster = Arc::new(RosterSynchronizer::new(
            channel.clone(),
            identity.clone(),
            ctx.events.clone(),
        ));
        Arc::new(Self {
            channel,
            identity,
            options,
            ctx,
            roster,
            dispatcher,
            inner: Mutex::new(ChannelInner::default()),
        })
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn options(&self) -> ConnectOptions {
        self.options
    }

    pub fn text_state(&self) -> ConnectionState {
        self.inner.lock().text
    }

    pub fn audio_state(&self) -> ConnectionState {
        self.inner.lock().audio
    }

    pub fn channel_state(&self) -> ConnectionState {
        self.inner.lock().overall
    }

    pub fn is_connected(&self) -> bool {
        self.channel_state() == ConnectionState::Connected
    }

    /// Joining, joined, or still leaving.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.overall != ConnectionState::Disconnected || inner.attempt.is_some()
    }

    pub fn roster(&self) -> &Arc<RosterSynchronizer> {
        &self.roster
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn send_group(&self, text: impl Into<String>) -> Result<PendingOperation, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(format!(
                "{} is not connected",
                self.channel.name()
            )));
        }
        Ok(self.dispatcher.send_group(self.channel.clone(), text.into()))
    }

    pub(crate) fn connect(self: &Arc<Self>, token: Token) -> PendingOperation {
        let cancel = {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.attempt.take() {
                previous.cancel();
            }
            self.bind_handlers(&mut inner);
            let cancel = CancellationToken::new();
            inner.attempt = Some(cancel.clone());
            self.set_state(&mut inner, ChannelProperty::ChannelState, ConnectionState::Connecting);
            if self.options.text {
                self.set_state(&mut inner, ChannelProperty::TextState, ConnectionState::Connecting);
            }
            if self.options.audio {
                self.set_state(&mut inner, ChannelProperty::AudioState, ConnectionState::Connecting);
            }
            cancel
        };

        let session = Arc::clone(self);
        PendingOperation::spawn(RemoteOperation::Connect, async move {
            let result = session
                .ctx
                .provider
                .connect(&session.identity, &session.channel, session.options, &token)
                .await;
            session.complete_connect(&cancel, result).await
        })
    }

    async fn complete_connect(
        &self,
        cancel: &CancellationToken,
        result: Result<()>,
    ) -> Result<(), SessionError> {
        let stale = {
            let mut inner = self.inner.lock();
            if cancel.is_cancelled() {
                true
            } else {
                inner.attempt = None;
                match &result {
                    Ok(()) => {
                        if self.options.text {
                            self.set_state(&mut inner, ChannelProperty::TextState, ConnectionState::Connected);
                        }
                        if self.options.audio {
                            self.set_state(&mut inner, ChannelProperty::AudioState, ConnectionState::Connected);
                        }
                        self.set_state(&mut inner, ChannelProperty::ChannelState, ConnectionState::Connected);
                    }
                    Err(_) => self.reset(&mut inner),
                }
                false
            }
        };

        if stale {
            debug!(channel = self.channel.name(), "channel: connect completed after leave; ignored");
            if result.is_ok() {
                if let Err(err) = self
                    .ctx
                    .provider
                    .disconnect(&self.identity, &self.channel)
                    .await
                {
                    debug!(channel = self.channel.name(), "channel: cleanup disconnect failed: {err}");
                }
            }
            return Err(SessionError::NotConnected(format!(
                "join of {} was cancelled",
                self.channel.name()
            )));
        }

        result.map_err(|err| {
            let err = SessionError::remote(RemoteOperation::Connect, err);
            warn!(channel = self.channel.name(), "channel: {err}");
            let _ = self.ctx.events.send(ClientEvent::Error(ErrorReport::from(&err)));
            err
        })
    }

    /// Disconnects and unbinds. Safe while still connecting: the in-flight
    /// connect is cancelled and its completion undoes a late join at the
    /// service, so no disconnect is sent from here.
    pub fn leave(self: &Arc<Self>) -> PendingOperation {
        {
            let mut inner = self.inner.lock();
            let idle = inner.overall == ConnectionState::Disconnected && inner.attempt.is_none();
            if idle || inner.overall == ConnectionState::Disconnecting {
                return PendingOperation::ready(RemoteOperation::Disconnect, Ok(()));
            }
            let superseded = match inner.attempt.take() {
                Some(attempt) => {
                    attempt.cancel();
                    true
                }
                None => false,
            };
            self.unbind_handlers(&mut inner);
            self.roster.clear();
            for property in [
                ChannelProperty::TextState,
                ChannelProperty::AudioState,
                ChannelProperty::ChannelState,
            ] {
                if inner.get(property) != ConnectionState::Disconnected {
                    self.set_state(&mut inner, property, ConnectionState::Disconnecting);
                }
            }
            if superseded {
                debug!(channel = self.channel.name(), "channel: join cancelled by leave");
                self.reset(&mut inner);
                return PendingOperation::ready(RemoteOperation::Disconnect, Ok(()));
            }
        }

        let session = Arc::clone(self);
        PendingOperation::spawn(RemoteOperation::Disconnect, async move {
            let result = session
                .ctx
                .provider
                .disconnect(&session.identity, &session.channel)
                .await;
            {
                let mut inner = session.inner.lock();
                session.reset(&mut inner);
            }
            result.map_err(|err| {
                let err = SessionError::remote(RemoteOperation::Disconnect, err);
                warn!(channel = session.channel.name(), "channel: {err}");
                let _ = session
                    .ctx
                    .events
                    .send(ClientEvent::Error(ErrorReport::from(&err)));
                err
            })
        })
    }

    /// Drops local state without contacting the service, for a login that
    /// ended underneath this channel.
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock();
        if let Some(attempt) = inner.attempt.take() {
            attempt.cancel();
        }
        self.reset(&mut inner);
    }

    fn reset(&self, inner: &mut ChannelInner) {
        self.unbind_handlers(inner);
        self.roster.clear();
        for property in [
            ChannelProperty::TextState,
            ChannelProperty::AudioState,
            ChannelProperty::ChannelState,
        ] {
            self.set_state(inner, property, ConnectionState::Disconnected);
        }
    }

    fn bind_handlers(self: &Arc<Self>, inner: &mut ChannelInner) {
        if inner.subscriptions.is_bound() {
            return;
        }
        let hub = &self.ctx.hub;
        let session: Arc<dyn NotificationHandler> = Arc::clone(self) as _;
        let roster: Arc<dyn NotificationHandler> = Arc::clone(&self.roster) as _;
        inner
            .subscriptions
            .push(hub.bind(Topic::ChannelState, Arc::clone(&session)));
        inner.subscriptions.push(hub.bind(Topic::Participants, roster));
        inner.subscriptions.push(hub.bind(Topic::MessageLog, session));
    }

    fn unbind_handlers(&self, inner: &mut ChannelInner) {
        self.ctx.hub.unbind_all(inner.subscriptions.take());
    }

    fn set_state(&self, inner: &mut ChannelInner, property: ChannelProperty, next: ConnectionState) {
        let slot = inner.slot(property);
        if *slot == next {
            return;
        }
        *slot = next;
        let phase = channel_phase(property, next, self.channel.name());
        info!(channel = self.channel.name(), ?property, state = ?next, "{phase}");
        let _ = self.ctx.events.send(ClientEvent::ChannelStateChanged {
            channel: self.channel.name().to_string(),
            property,
            state: next,
            phase,
        });
    }
}

impl NotificationHandler for ChannelSession {
    fn handle(&self, notification: &ServiceNotification) {
        match notification {
            ServiceNotification::ChannelPropertyChanged {
                identity,
                channel,
                property,
                state,
            } if identity == &self.identity && channel == &self.channel => {
                let mut inner = self.inner.lock();
                let current = inner.get(*property);
                if current == *state {
                    return;
                }
                if !current.can_advance_to(*state) {
                    debug!(
                        channel = self.channel.name(),
                        ?property,
                        current = ?current,
                        reported = ?state,
                        "channel: stale state report ignored"
                    );
                    return;
                }
                self.set_state(&mut inner, *property, *state);

                let dropped = *property == ChannelProperty::ChannelState
                    && *state == ConnectionState::Disconnected
                    && inner.attempt.is_none();
                if dropped {
                    warn!(channel = self.channel.name(), "channel: disconnected by service");
                    self.reset(&mut inner);
                }
            }
            ServiceNotification::GroupMessage { channel, message } if channel == &self.channel => {
                self.dispatcher.deliver_group(channel, message);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
