use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ParticipantKey, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfiguration,
    NotAuthenticated,
    NotConnected,
    AlreadyActive,
    RemoteOperationFailed,
    MissingParticipant,
    UnknownRequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    Login,
    Logout,
    Connect,
    Disconnect,
    SendGroup,
    SendDirected,
    SetMute,
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SendGroup => "group send",
            Self::SendDirected => "directed send",
            Self::SetMute => "set mute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("session already active for {0}")]
    AlreadyActive(String),
    #[error("{operation} failed: {message}")]
    RemoteOperationFailed {
        operation: RemoteOperation,
        message: String,
    },
    #[error("participant {key} is not resolvable")]
    MissingParticipant { key: ParticipantKey },
    #[error("no pending directed message for request {request_id}")]
    UnknownRequestId { request_id: RequestId },
}

impl SessionError {
    pub fn remote(operation: RemoteOperation, err: impl fmt::Display) -> Self {
        Self::RemoteOperationFailed {
            operation,
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
            Self::NotAuthenticated(_) => ErrorCode::NotAuthenticated,
            Self::NotConnected(_) => ErrorCode::NotConnected,
            Self::AlreadyActive(_) => ErrorCode::AlreadyActive,
            Self::RemoteOperationFailed { .. } => ErrorCode::RemoteOperationFailed,
            Self::MissingParticipant { .. } => ErrorCode::MissingParticipant,
            Self::UnknownRequestId { .. } => ErrorCode::UnknownRequestId,
        }
    }
}

/// Serializable error payload carried by application events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&SessionError> for ErrorReport {
    fn from(value: &SessionError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
