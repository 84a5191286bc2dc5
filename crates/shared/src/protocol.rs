use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelProperty, ConnectionState, LoginState, RequestId},
    error::ErrorReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterChange {
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub sender_name: String,
    pub text: String,
    pub is_directed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    LoginStateChanged {
        username: String,
        state: LoginState,
        phase: String,
    },
    ChannelStateChanged {
        channel: String,
        property: ChannelProperty,
        state: ConnectionState,
        phase: String,
    },
    MessageReceived(IncomingMessage),
    RosterChanged {
        channel: String,
        username: String,
        change: RosterChange,
    },
    DirectedMessageSent {
        request_id: RequestId,
        recipient: String,
        text: String,
    },
    SendFailed {
        original_text: String,
    },
    LocalMuteChanged {
        muted: bool,
    },
    Error(ErrorReport),
}

pub fn login_phase(state: LoginState, username: &str) -> String {
    match state {
        LoginState::LoggingIn => "Logging In".to_string(),
        LoginState::LoggedIn => format!("Logged In {username}"),
        LoginState::LoggingOut => "Logging Out".to_string(),
        LoginState::LoggedOut => format!("Logged Out {username}"),
    }
}

pub fn channel_phase(property: ChannelProperty, state: ConnectionState, channel: &str) -> String {
    let verb = match state {
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Connected => "Connected",
        ConnectionState::Disconnecting => "Disconnecting",
        ConnectionState::Disconnected => "Disconnected",
    };
    match property {
        ChannelProperty::TextState => format!("Text Channel {verb}"),
        ChannelProperty::AudioState => format!("Audio Channel {verb}"),
        ChannelProperty::ChannelState if state == ConnectionState::Connecting => {
            "Channel Connecting".to_string()
        }
        ChannelProperty::ChannelState => format!("{channel} {verb}"),
    }
}
