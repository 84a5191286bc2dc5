use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use shared::{
    domain::{ChannelRef, ChannelType, Identity, LoginState, RequestId, SubscriptionMode},
    error::{RemoteOperation, SessionError},
    protocol::ClientEvent,
};
use token_issuer::TokenIssuer;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod event_hub;
pub mod login;
pub mod loopback;
pub mod operation;
pub mod provider;
pub mod roster;
#[cfg(test)]
mod test_support;

pub use channel::ChannelSession;
pub use config::{load_settings, ClientSettings};
pub use event_hub::{EventHub, NotificationHandler, Subscription, Topic};
pub use login::LoginSession;
pub use loopback::LoopbackProvider;
pub use operation::PendingOperation;
pub use provider::{CommsProvider, ConnectOptions, ServiceNotification};

/// Collaborators shared by every session a manager creates.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) hub: Arc<EventHub>,
    pub(crate) provider: Arc<dyn CommsProvider>,
    pub(crate) tokens: Arc<TokenIssuer>,
    pub(crate) token_validity: Duration,
    pub(crate) subscription_mode: SubscriptionMode,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

/// Who plain text typed into the front end goes to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Recipient {
    #[default]
    Everyone,
    User(String),
}

impl Recipient {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("everyone") {
            Self::Everyone
        } else {
            Self::User(raw.to_string())
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => f.write_str("everyone"),
            Self::User(name) => f.write_str(name),
        }
    }
}

/// Owns the login session, the notification pump and the application event
/// stream. Must be created inside a tokio runtime.
pub struct SessionManager {
    settings: ClientSettings,
    ctx: SessionContext,
    login: Mutex<Option<Arc<LoginSession>>>,
    active_channel: Mutex<Option<ChannelRef>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl SessionManager {
    pub fn new(
        settings: ClientSettings,
        provider: Arc<dyn CommsProvider>,
    ) -> Result<Arc<Self>, SessionError> {
        let tokens = TokenIssuer::new(&settings.token_config())?;
        if settings.event_buffer == 0 {
            return Err(SessionError::InvalidConfiguration(
                "event_buffer must be at least 1".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(settings.event_buffer);
        let hub = Arc::new(EventHub::new());
        let pump = hub.spawn_pump(provider.subscribe_notifications());
        info!(server_url = %settings.server_url, issuer = %settings.issuer, "session manager started");

        Ok(Arc::new(Self {
            ctx: SessionContext {
                hub,
                provider,
                tokens: Arc::new(tokens),
                token_validity: settings.token_validity(),
                subscription_mode: settings.subscription_mode,
                events,
            },
            settings,
            login: Mutex::new(None),
            active_channel: Mutex::new(None),
            pump: Mutex::new(Some(pump)),
            closed: CancellationToken::new(),
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.events.subscribe()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.ctx.hub
    }

    pub fn identity_for(&self, username: &str) -> Identity {
        Identity::new(&self.settings.issuer, username, &self.settings.domain)
    }

    pub fn channel_ref(&self, name: &str, channel_type: ChannelType) -> ChannelRef {
        ChannelRef::new(&self.settings.issuer, name, &self.settings.domain, channel_type)
    }

    /// Logs in as `username`. Repeating the call for the user already
    /// logging in or logged in does nothing.
    pub fn login(&self, username: &str) -> Result<PendingOperation, SessionError> {
        self.ensure_open()?;
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::NotAuthenticated(
                "username must not be empty".to_string(),
            ));
        }

        let mut slot = self.login.lock();
        if let Some(current) = slot.as_ref() {
            if current.state() != LoginState::LoggedOut {
                if current.identity().username() == username {
                    debug!(username, "login: already active");
                    return Ok(PendingOperation::ready(RemoteOperation::Login, Ok(())));
                }
                return Err(SessionError::AlreadyActive(
                    current.identity().username().to_string(),
                ));
            }
        }

        let session = LoginSession::new(self.identity_for(username), self.ctx.clone());
        let pending = session.login()?;
        *slot = Some(session);
        Ok(pending)
    }

    pub fn logout(&self) -> PendingOperation {
        if let Err(err) = self.ensure_open() {
            return PendingOperation::ready(RemoteOperation::Logout, Err(err));
        }
        self.active_channel.lock().take();
        match self.login_session() {
            Some(session) => session.logout(),
            None => PendingOperation::ready(RemoteOperation::Logout, Ok(())),
        }
    }

    pub fn join(
        &self,
        name: &str,
        channel_type: ChannelType,
    ) -> Result<(Arc<ChannelSession>, PendingOperation), SessionError> {
        self.join_with_options(name, channel_type, ConnectOptions::default())
    }

    pub fn join_with_options(
        &self,
        name: &str,
        channel_type: ChannelType,
        options: ConnectOptions,
    ) -> Result<(Arc<ChannelSession>, PendingOperation), SessionError> {
        self.ensure_open()?;
        let session = self.login_session().ok_or_else(|| {
            SessionError::NotAuthenticated("no user is logged in".to_string())
        })?;
        let channel = self.channel_ref(name, channel_type);
        let joined = session.join_channel(channel.clone(), options)?;
        *self.active_channel.lock() = Some(channel);
        Ok(joined)
    }

    /// Leaves the channel most recently joined.
    pub fn leave(&self) -> PendingOperation {
        if let Err(err) = self.ensure_open() {
            return PendingOperation::ready(RemoteOperation::Disconnect, Err(err));
        }
        let channel = self.active_channel.lock().take();
        match (self.login_session(), channel) {
            (Some(session), Some(channel)) => session.leave_channel(&channel),
            _ => PendingOperation::ready(RemoteOperation::Disconnect, Ok(())),
        }
    }

    pub fn send_group(&self, text: &str) -> Result<PendingOperation, SessionError> {
        self.ensure_open()?;
        self.require_logged_in()?;
        let channel = self.active_channel().ok_or_else(|| {
            SessionError::NotConnected("no channel is joined".to_string())
        })?;
        channel.send_group(text)
    }

    pub fn send_directed(
        &self,
        username: &str,
        text: &str,
    ) -> Result<PendingOperation<RequestId>, SessionError> {
        self.ensure_open()?;
        let session = self.require_logged_in()?;
        Ok(session
            .dispatcher()
            .send_directed(self.identity_for(username), text.to_string()))
    }

    /// Group send for [`Recipient::Everyone`]; directed send for a user
    /// currently selectable in the joined channel.
    pub async fn send_to(&self, recipient: &Recipient, text: &str) -> Result<(), SessionError> {
        match recipient {
            Recipient::Everyone => self.send_group(text)?.wait().await,
            Recipient::User(name) => {
                self.ensure_open()?;
                self.require_logged_in()?;
                if !self.selectable_users().iter().any(|user| user == name) {
                    return Err(SessionError::NotConnected(format!(
                        "{name} is not in the channel"
                    )));
                }
                self.send_directed(name, text)?.wait().await.map(|_| ())
            }
        }
    }

    pub async fn set_local_mute(&self, muted: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.ctx
            .provider
            .set_input_muted(muted)
            .await
            .map_err(|err| SessionError::remote(RemoteOperation::SetMute, err))?;
        info!(muted, "local input mute changed");
        let _ = self.ctx.events.send(ClientEvent::LocalMuteChanged { muted });
        Ok(())
    }

    /// Flips the input mute and returns the new value.
    pub async fn toggle_local_mute(&self) -> Result<bool, SessionError> {
        let muted = !self.ctx.provider.input_muted();
        self.set_local_mute(muted).await?;
        Ok(muted)
    }

    pub fn login_state(&self) -> LoginState {
        self.login_session()
            .map(|session| session.state())
            .unwrap_or_default()
    }

    pub fn login_session(&self) -> Option<Arc<LoginSession>> {
        self.login.lock().clone()
    }

    pub fn active_channel(&self) -> Option<Arc<ChannelSession>> {
        let channel = self.active_channel.lock().clone()?;
        self.login_session()?.channel(&channel)
    }

    pub fn roster_usernames(&self) -> Vec<String> {
        let Some(channel) = self.active_channel() else {
            return Vec::new();
        };
        let mut usernames: Vec<String> = channel
            .roster()
            .snapshot()
            .participants()
            .map(|participant| participant.username().to_string())
            .collect();
        usernames.sort();
        usernames.dedup();
        usernames
    }

    pub fn selectable_users(&self) -> Vec<String> {
        self.active_channel()
            .map(|channel| channel.roster().selectable_users())
            .unwrap_or_default()
    }

    pub fn pending_directed_count(&self) -> usize {
        self.login_session()
            .map(|session| session.dispatcher().pending_count())
            .unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Leaves every channel, logs out and stops the notification pump.
    pub async fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.active_channel.lock().take();

        if let Some(session) = self.login_session() {
            if let Err(err) = session.logout().wait().await {
                warn!(username = session.identity().username(), "shutdown: logout failed: {err}");
            }
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        info!(
            subscriptions = self.ctx.hub.subscription_count(),
            "session manager shut down"
        );
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::InvalidConfiguration(
                "session manager is shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn require_logged_in(&self) -> Result<Arc<LoginSession>, SessionError> {
        self.login_session()
            .filter(|session| session.state() == LoginState::LoggedIn)
            .ok_or_else(|| SessionError::NotAuthenticated("no user is logged in".to_string()))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
