use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! key_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

key_newtype!(ParticipantKey);
key_newtype!(RequestId);

/// A communications account, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    issuer: String,
    username: String,
    domain: String,
}

impl Identity {
    pub fn new(
        issuer: impl Into<String>,
        username: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            username: username.into(),
            domain: domain.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn uri(&self) -> String {
        format!("{}:{}@{}", self.issuer, self.username, self.domain)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Positional,
    #[default]
    NonPositional,
}

/// A channel on the communications service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    issuer: String,
    name: String,
    domain: String,
    channel_type: ChannelType,
}

impl ChannelRef {
    pub fn new(
        issuer: impl Into<String>,
        name: impl Into<String>,
        domain: impl Into<String>,
        channel_type: ChannelType,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            name: name.into(),
            domain: domain.into(),
            channel_type,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub fn uri(&self) -> String {
        format!("{}:channel:{}@{}", self.issuer, self.name, self.domain)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    #[default]
    LoggedOut,
    LoggingIn,
    LoggedIn,
    LoggingOut,
}

impl LoginState {
    /// Whether a reported state moves this lifecycle forward. Reports that
    /// would move it backwards are stale.
    pub fn can_advance_to(self, next: LoginState) -> bool {
        matches!(
            (self, next),
            (Self::LoggingIn, Self::LoggedIn | Self::LoggingOut | Self::LoggedOut)
                | (Self::LoggedIn, Self::LoggingOut | Self::LoggedOut)
                | (Self::LoggingOut, Self::LoggedOut)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (
                Self::Connecting,
                Self::Connected | Self::Disconnecting | Self::Disconnected
            ) | (Self::Connected, Self::Disconnecting | Self::Disconnected)
                | (Self::Disconnecting, Self::Disconnected)
        )
    }
}

/// Named channel properties reported through property-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProperty {
    TextState,
    AudioState,
    ChannelState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    #[default]
    Accept,
    Block,
    Defer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub key: ParticipantKey,
    pub identity: Identity,
    pub is_muted: bool,
    pub is_speaking: bool,
}

impl Participant {
    pub fn new(key: impl Into<ParticipantKey>, identity: Identity) -> Self {
        Self {
            key: key.into(),
            identity,
            is_muted: false,
            is_speaking: false,
        }
    }

    pub fn username(&self) -> &str {
        self.identity.username()
    }
}
