use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{
    domain::{ChannelRef, ChannelType, Identity, RequestId, SubscriptionMode},
    error::RemoteOperation,
    protocol::ClientEvent,
};
use token_issuer::{Token, TokenIssuer};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::{
    config::ClientSettings,
    event_hub::EventHub,
    provider::{CommsProvider, ConnectOptions, NotificationFeed, ServiceNotification},
    SessionContext,
};

pub(crate) const SECRET: &str = "test-signing-secret";

pub(crate) fn settings() -> ClientSettings {
    ClientSettings {
        secret_key: Some(SECRET.to_string()),
        ..ClientSettings::default()
    }
}

pub(crate) fn identity(username: &str) -> Identity {
    let settings = settings();
    Identity::new(settings.issuer, username, settings.domain)
}

pub(crate) fn channel(name: &str) -> ChannelRef {
    let settings = settings();
    ChannelRef::new(settings.issuer, name, settings.domain, ChannelType::NonPositional)
}

/// Context without a notification pump; tests dispatch by hand.
pub(crate) fn context(provider: Arc<dyn CommsProvider>) -> SessionContext {
    let settings = settings();
    let (events, _) = broadcast::channel(256);
    SessionContext {
        hub: Arc::new(EventHub::new()),
        provider,
        tokens: Arc::new(TokenIssuer::new(&settings.token_config()).expect("token issuer")),
        token_validity: settings.token_validity(),
        subscription_mode: settings.subscription_mode,
        events,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub(crate) async fn next_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if matches(&event) {
                break event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything already buffered on `rx`.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Provider whose calls succeed unless told otherwise, and that never
/// pushes notifications on its own.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    notifications: NotificationFeed,
    calls: Mutex<Vec<String>>,
    tokens: Mutex<Vec<Token>>,
    failing: Mutex<Vec<RemoteOperation>>,
    login_gate: Mutex<Option<Arc<Notify>>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    next_request: AtomicU64,
    muted: AtomicBool,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail(&self, operation: RemoteOperation) {
        self.failing.lock().push(operation);
    }

    /// Holds every login until the returned gate is notified.
    pub(crate) fn gate_login(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.login_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Holds every connect until the returned gate is notified.
    pub(crate) fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn push(&self, notification: ServiceNotification) {
        self.notifications.publish(notification);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub(crate) fn tokens(&self) -> Vec<Token> {
        self.tokens.lock().clone()
    }

    fn record(&self, operation: RemoteOperation, call: String) -> Result<()> {
        self.calls.lock().push(call);
        if self.failing.lock().contains(&operation) {
            bail!("scripted {operation} failure");
        }
        Ok(())
    }
}

#[async_trait]
impl CommsProvider for ScriptedProvider {
    async fn login(&self, identity: &Identity, token: &Token, _mode: SubscriptionMode) -> Result<()> {
        self.tokens.lock().push(token.clone());
        let gate = self.login_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(RemoteOperation::Login, format!("login {}", identity.username()))
    }

    async fn logout(&self, identity: &Identity) -> Result<()> {
        self.record(RemoteOperation::Logout, format!("logout {}", identity.username()))
    }

    async fn connect(
        &self,
        _identity: &Identity,
        channel: &ChannelRef,
        _options: ConnectOptions,
        token: &Token,
    ) -> Result<()> {
        self.tokens.lock().push(token.clone());
        let gate = self.connect_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(RemoteOperation::Connect, format!("connect {}", channel.name()))
    }

    async fn disconnect(&self, _identity: &Identity, channel: &ChannelRef) -> Result<()> {
        self.record(RemoteOperation::Disconnect, format!("disconnect {}", channel.name()))
    }

    async fn send_group_text(&self, _identity: &Identity, channel: &ChannelRef, text: &str) -> Result<()> {
        self.record(RemoteOperation::SendGroup, format!("group {} {text}", channel.name()))
    }

    async fn send_directed_text(&self, _sender: &Identity, recipient: &Identity, text: &str) -> Result<RequestId> {
        self.record(
            RemoteOperation::SendDirected,
            format!("directed {} {text}", recipient.username()),
        )?;
        let n = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RequestId(format!("req-{n}")))
    }

    async fn set_input_muted(&self, muted: bool) -> Result<()> {
        self.record(RemoteOperation::SetMute, format!("mute {muted}"))?;
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn input_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<ServiceNotification> {
        self.notifications.subscribe()
    }
}
