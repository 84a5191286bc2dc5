use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use shared::{
    domain::{ChannelRef, Identity, LoginState},
    error::{ErrorReport, RemoteOperation, SessionError},
    protocol::{login_phase, ClientEvent},
};
use token_issuer::TokenScope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::ChannelSession,
    dispatcher::MessageDispatcher,
    event_hub::{NotificationHandler, SubscriptionSet, Topic},
    operation::PendingOperation,
    provider::{ConnectOptions, ServiceNotification},
    SessionContext,
};

#[derive(Default)]
struct LoginInner {
    state: LoginState,
    subscriptions: SubscriptionSet,
    attempt: Option<CancellationToken>,
    channels: HashMap<ChannelRef, Arc<ChannelSession>>,
}

/// Authentication state machine for one local identity.
pub struct LoginSession {
    identity: Identity,
    ctx: SessionContext,
    dispatcher: Arc<MessageDispatcher>,
    inner: Mutex<LoginInner>,
}

impl LoginSession {
    pub(crate) fn new(identity: Identity, ctx: SessionContext) -> Arc<Self> {
        let dispatcher = Arc::new(MessageDispatcher::new(
            identity.clone(),
            Arc::clone(&ctx.provider),
            ctx.events.clone(),
        ));
        Arc::new(Self {
            identity,
            ctx,
            dispatcher,
            inner: Mutex::new(LoginInner::default()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> LoginState {
        self.inner.lock().state
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Handlers this session currently has bound on the hub.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn channel(&self, channel: &ChannelRef) -> Option<Arc<ChannelSession>> {
        self.inner.lock().channels.get(channel).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<ChannelSession>> {
        self.inner.lock().channels.values().cloned().collect()
    }

    /// Starts a login. The state is `LoggingIn` when this returns; the
    /// returned operation resolves once the service answers.
    pub fn login(self: &Arc<Self>) -> Result<PendingOperation, SessionError> {
        let (cancel, token) = {
            let mut inner = self.inner.lock();
            if inner.state != LoginState::LoggedOut {
                return Err(SessionError::AlreadyActive(
                    self.identity.username().to_string(),
                ));
            }
            let token = self.ctx.tokens.issue(
                &TokenScope::Login {
                    identity: self.identity.clone(),
                },
                self.ctx.token_validity,
            )?;
            if let Some(previous) = inner.attempt.take() {
                previous.cancel();
            }
            self.bind_handlers(&mut inner);
            let cancel = CancellationToken::new();
            inner.attempt = Some(cancel.clone());
            self.transition(&mut inner, LoginState::LoggingIn);
            (cancel, token)
        };

        let session = Arc::clone(self);
        let mode = self.ctx.subscription_mode;
        Ok(PendingOperation::spawn(RemoteOperation::Login, async move {
            let result = session
                .ctx
                .provider
                .login(&session.identity, &token, mode)
                .await;
            session.complete_login(&cancel, result).await
        }))
    }

    async fn complete_login(
        &self,
        cancel: &CancellationToken,
        result: Result<()>,
    ) -> Result<(), SessionError> {
        let applied = {
            let mut inner = self.inner.lock();
            if cancel.is_cancelled() {
                None
            } else {
                inner.attempt = None;
                Some(match (&result, inner.state) {
                    (Ok(()), LoginState::LoggingIn) => {
                        self.transition(&mut inner, LoginState::LoggedIn);
                        Ok(())
                    }
                    (Ok(()), LoginState::LoggedIn) => Ok(()),
                    (Ok(()), state) => {
                        self.unbind_handlers(&mut inner);
                        Err(SessionError::NotAuthenticated(format!(
                            "service reported {state:?} for {}",
                            self.identity.username()
                        )))
                    }
                    (Err(_), _) => {
                        self.unbind_handlers(&mut inner);
                        self.transition(&mut inner, LoginState::LoggedOut);
                        Ok(())
                    }
                })
            }
        };

        let Some(applied) = applied else {
            debug!(
                username = self.identity.username(),
                "login: completion arrived after logout; ignored"
            );
            if result.is_ok() {
                if let Err(err) = self.ctx.provider.logout(&self.identity).await {
                    debug!(username = self.identity.username(), "login: cleanup logout failed: {err}");
                }
            }
            return Err(SessionError::NotAuthenticated(format!(
                "login for {} was cancelled",
                self.identity.username()
            )));
        };
        applied?;

        result.map_err(|err| {
            let err = SessionError::remote(RemoteOperation::Login, err);
            warn!(username = self.identity.username(), "login: {err}");
            let _ = self.ctx.events.send(ClientEvent::Error(ErrorReport::from(&err)));
            err
        })
    }

    /// Leaves every channel, then logs out. A no-op unless logging in or
    /// logged in. A login still in flight is cancelled instead; its
    /// completion logs out at the service if it succeeded there.
    pub fn logout(self: &Arc<Self>) -> PendingOperation {
        let (leaving, superseded) = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, LoginState::LoggedOut | LoginState::LoggingOut) {
                return PendingOperation::ready(RemoteOperation::Logout, Ok(()));
            }
            let superseded = match inner.attempt.take() {
                Some(attempt) => {
                    attempt.cancel();
                    true
                }
                None => false,
            };
            let leaving: Vec<PendingOperation> = inner
                .channels
                .drain()
                .map(|(_, channel)| channel.leave())
                .collect();
            self.transition(&mut inner, LoginState::LoggingOut);
            (leaving, superseded)
        };

        if superseded {
            debug!(username = self.identity.username(), "login: cancelled by logout");
            self.finish_logout();
            return PendingOperation::ready(RemoteOperation::Logout, Ok(()));
        }

        let session = Arc::clone(self);
        PendingOperation::spawn(RemoteOperation::Logout, async move {
            for pending in leaving {
                let _ = pending.wait().await;
            }
            let result = session.ctx.provider.logout(&session.identity).await;
            session.finish_logout();
            result.map_err(|err| {
                let err = SessionError::remote(RemoteOperation::Logout, err);
                warn!(username = session.identity.username(), "logout: {err}");
                let _ = session
                    .ctx
                    .events
                    .send(ClientEvent::Error(ErrorReport::from(&err)));
                err
            })
        })
    }

    fn finish_logout(&self) {
        let mut inner = self.inner.lock();
        if let Some(attempt) = inner.attempt.take() {
            attempt.cancel();
        }
        for (_, channel) in inner.channels.drain() {
            channel.detach();
        }
        self.unbind_handlers(&mut inner);
        self.transition(&mut inner, LoginState::LoggedOut);
        self.dispatcher.clear_pending();
    }

    /// Joins `channel`, or returns the session already joining or joined.
    pub fn join_channel(
        self: &Arc<Self>,
        channel: ChannelRef,
        options: ConnectOptions,
    ) -> Result<(Arc<ChannelSession>, PendingOperation), SessionError> {
        let mut inner = self.inner.lock();
        if inner.state != LoginState::LoggedIn {
            return Err(SessionError::NotAuthenticated(format!(
                "{} is not logged in",
                self.identity.username()
            )));
        }
        if let Some(existing) = inner.channels.get(&channel) {
            if existing.is_active() {
                debug!(channel = channel.name(), "channel: already joined");
                return Ok((
                    Arc::clone(existing),
                    PendingOperation::ready(RemoteOperation::Connect, Ok(())),
                ));
            }
        }

        let token = self.ctx.tokens.issue(
            &TokenScope::Join {
                identity: self.identity.clone(),
                channel: channel.clone(),
            },
            self.ctx.token_validity,
        )?;
        let session = ChannelSession::new(
            channel.clone(),
            self.identity.clone(),
            options,
            self.ctx.clone(),
            Arc::clone(&self.dispatcher),
        );
        inner.channels.insert(channel.clone(), Arc::clone(&session));
        let connect = session.connect(token);
        drop(inner);

        let owner = Arc::clone(self);
        let joined = Arc::clone(&session);
        let pending = PendingOperation::spawn(RemoteOperation::Connect, async move {
            let result = connect.wait().await;
            if result.is_err() {
                owner.forget_channel(&channel, &joined);
            }
            result
        });
        Ok((session, pending))
    }

    pub fn leave_channel(&self, channel: &ChannelRef) -> PendingOperation {
        let session = self.inner.lock().channels.remove(channel);
        match session {
            Some(session) => session.leave(),
            None => PendingOperation::ready(RemoteOperation::Disconnect, Ok(())),
        }
    }

    fn forget_channel(&self, channel: &ChannelRef, session: &Arc<ChannelSession>) {
        let mut inner = self.inner.lock();
        if inner
            .channels
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            inner.channels.remove(channel);
        }
    }

    fn bind_handlers(self: &Arc<Self>, inner: &mut LoginInner) {
        if inner.subscriptions.is_bound() {
            return;
        }
        let hub = &self.ctx.hub;
        let state_handler: Arc<dyn NotificationHandler> = Arc::clone(self) as _;
        let message_handler: Arc<dyn NotificationHandler> = Arc::clone(&self.dispatcher) as _;
        inner
            .subscriptions
            .push(hub.bind(Topic::LoginState, state_handler));
        inner
            .subscriptions
            .push(hub.bind(Topic::DirectedMessages, Arc::clone(&message_handler)));
        inner
            .subscriptions
            .push(hub.bind(Topic::FailedDirectedMessages, message_handler));
    }

    fn unbind_handlers(&self, inner: &mut LoginInner) {
        self.ctx.hub.unbind_all(inner.subscriptions.take());
    }

    fn transition(&self, inner: &mut LoginInner, next: LoginState) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        let username = self.identity.username().to_string();
        let phase = login_phase(next, &username);
        info!(username = %username, state = ?next, "{phase}");
        let _ = self.ctx.events.send(ClientEvent::LoginStateChanged {
            username,
            state: next,
            phase,
        });
    }
}

impl NotificationHandler for LoginSession {
    fn handle(&self, notification: &ServiceNotification) {
        let ServiceNotification::LoginStateChanged { identity, state } = notification else {
            return;
        };
        if identity != &self.identity {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.state == *state {
            return;
        }
        if !inner.state.can_advance_to(*state) {
            debug!(
                username = self.identity.username(),
                current = ?inner.state,
                reported = ?state,
                "login: stale state report ignored"
            );
            return;
        }

        if *state == LoginState::LoggedOut && inner.attempt.is_none() {
            // Logged out by the service, or our own logout finishing.
            for (_, channel) in inner.channels.drain() {
                channel.detach();
            }
            self.unbind_handlers(&mut inner);
            self.dispatcher.clear_pending();
        }
        self.transition(&mut inner, *state);
    }
}

#[cfg(test)]
#[path = "tests/login_tests.rs"]
mod tests;
