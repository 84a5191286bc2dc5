use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChannelRef, Identity},
    error::SessionError,
};

pub const DEFAULT_TOKEN_VALIDITY: StdDuration = StdDuration::from_secs(90);

#[derive(Debug, Clone)]
pub struct TokenIssuerConfig {
    pub issuer: String,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAction {
    Login,
    Join,
}

/// What a token authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenScope {
    Login { identity: Identity },
    Join { identity: Identity, channel: ChannelRef },
}

impl TokenScope {
    pub fn action(&self) -> TokenAction {
        match self {
            Self::Login { .. } => TokenAction::Login,
            Self::Join { .. } => TokenAction::Join,
        }
    }

    fn subject(&self) -> String {
        match self {
            Self::Login { identity } | Self::Join { identity, .. } => identity.uri(),
        }
    }

    fn audience(&self) -> Option<String> {
        match self {
            Self::Login { .. } => None,
            Self::Join { channel, .. } => Some(channel.uri()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub act: TokenAction,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    encoded: String,
    action: TokenAction,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn action(&self) -> TokenAction {
        self.action
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

pub struct TokenIssuer {
    issuer: String,
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(cfg: &TokenIssuerConfig) -> Result<Self, SessionError> {
        let secret = signing_secret(cfg)?;
        Ok(Self {
            issuer: cfg.issuer.clone(),
            key: EncodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn issue(&self, scope: &TokenScope, validity: StdDuration) -> Result<Token, SessionError> {
        self.issue_at(scope, validity, Utc::now())
    }

    /// Same claims and signature for the same scope, validity and clock reading.
    pub fn issue_at(
        &self,
        scope: &TokenScope,
        validity: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Token, SessionError> {
        let validity = Duration::from_std(validity).map_err(|_| {
            SessionError::InvalidConfiguration(format!(
                "token validity of {}s is out of range",
                validity.as_secs()
            ))
        })?;
        let exp = now + validity;
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: scope.subject(),
            aud: scope.audience(),
            act: scope.action(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let encoded = encode(&Header::default(), &claims, &self.key).map_err(|err| {
            SessionError::InvalidConfiguration(format!("failed to sign token: {err}"))
        })?;

        Ok(Token {
            encoded,
            action: claims.act,
            expires_at: exp,
        })
    }
}

/// Checks tokens minted by a [`TokenIssuer`] sharing the same secret.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(cfg: &TokenIssuerConfig) -> Result<Self, SessionError> {
        let secret = signing_secret(cfg)?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[cfg.issuer.as_str()]);
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify(&self, token: &Token, expected: &TokenScope) -> Result<TokenClaims, SessionError> {
        let claims = decode::<TokenClaims>(token.as_str(), &self.key, &self.validation)
            .map_err(|err| SessionError::NotAuthenticated(format!("token rejected: {err}")))?
            .claims;

        if claims.act != expected.action() {
            return Err(SessionError::NotAuthenticated(format!(
                "token action {:?} does not match {:?}",
                claims.act,
                expected.action()
            )));
        }
        if claims.sub != expected.subject() || claims.aud != expected.audience() {
            return Err(SessionError::NotAuthenticated(
                "token was issued for a different subject".to_string(),
            ));
        }

        Ok(claims)
    }
}

fn signing_secret(cfg: &TokenIssuerConfig) -> Result<&str, SessionError> {
    match cfg.secret_key.as_deref().map(str::trim) {
        Some(secret) if !secret.is_empty() => Ok(secret),
        _ => Err(SessionError::InvalidConfiguration(
            "token signing key is not configured".to_string(),
        )),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
