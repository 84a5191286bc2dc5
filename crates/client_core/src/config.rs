use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shared::domain::{ChannelType, SubscriptionMode};
use token_issuer::TokenIssuerConfig;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub issuer: String,
    pub domain: String,
    pub secret_key: Option<String>,
    pub token_ttl_seconds: u64,
    pub subscription_mode: SubscriptionMode,
    pub default_channel_type: ChannelType,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "loopback://localhost".into(),
            issuer: "presence".into(),
            domain: "presence.local".into(),
            secret_key: None,
            token_ttl_seconds: token_issuer::DEFAULT_TOKEN_VALIDITY.as_secs(),
            subscription_mode: SubscriptionMode::Accept,
            default_channel_type: ChannelType::NonPositional,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    pub fn token_config(&self) -> TokenIssuerConfig {
        TokenIssuerConfig {
            issuer: self.issuer.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

/// Defaults, then the TOML file, then environment overrides.
///
/// An explicit `path` must exist. Without one, `client.toml` in the working
/// directory is read when present.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

pub(crate) fn load_settings_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ClientSettings> {
    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()),
    };

    let mut settings = match file {
        Some(file) => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read settings file '{}'", file.display()))?;
            toml::from_str::<ClientSettings>(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", file.display()))?
        }
        None => ClientSettings::default(),
    };

    apply_env_overrides(&mut settings, env);
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    let lookup = |primary: &str, alias: &str| env(alias).or_else(|| env(primary));

    if let Some(v) = lookup("PRESENCE_SERVER_URL", "APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("PRESENCE_ISSUER", "APP__ISSUER") {
        settings.issuer = v;
    }
    if let Some(v) = lookup("PRESENCE_DOMAIN", "APP__DOMAIN") {
        settings.domain = v;
    }
    if let Some(v) = lookup("PRESENCE_SECRET_KEY", "APP__SECRET_KEY") {
        settings.secret_key = Some(v);
    }
    if let Some(v) = lookup("PRESENCE_TOKEN_TTL_SECONDS", "APP__TOKEN_TTL_SECONDS") {
        match v.trim().parse::<u64>() {
            Ok(parsed) => settings.token_ttl_seconds = parsed,
            Err(err) => warn!(value = %v, "config: ignoring token ttl override: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
