use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, LoopbackProvider, Recipient, SessionManager};
use shared::domain::ChannelType;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `client.toml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log in as this user on start.
    #[arg(long)]
    username: Option<String>,
    /// Join this channel after the start-up login.
    #[arg(long)]
    channel: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login(String),
    Logout,
    Join { name: String, positional: bool },
    Leave,
    To(Recipient),
    Mute,
    Who,
    PeerJoin(String),
    PeerLeave(String),
    Quit,
    Say(String),
    Invalid(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };

    let mut words = rest.split_whitespace();
    let command = match (words.next(), words.next(), words.next()) {
        (Some("login"), Some(name), None) => Command::Login(name.to_string()),
        (Some("logout"), None, _) => Command::Logout,
        (Some("join"), Some(name), None) => Command::Join {
            name: name.to_string(),
            positional: false,
        },
        (Some("join"), Some(name), Some("positional")) => Command::Join {
            name: name.to_string(),
            positional: true,
        },
        (Some("leave"), None, _) => Command::Leave,
        (Some("to"), Some(target), None) => Command::To(Recipient::parse(target)),
        (Some("mute"), None, _) => Command::Mute,
        (Some("who"), None, _) => Command::Who,
        (Some("peer"), Some("join"), Some(name)) => Command::PeerJoin(name.to_string()),
        (Some("peer"), Some("leave"), Some(name)) => Command::PeerLeave(name.to_string()),
        (Some("quit"), None, _) => Command::Quit,
        _ => Command::Invalid(line.to_string()),
    };
    Some(command)
}

struct Repl {
    manager: Arc<SessionManager>,
    provider: Arc<LoopbackProvider>,
    recipient: Recipient,
}

impl Repl {
    /// Returns false once the user asked to quit.
    async fn run(&mut self, command: Command) -> bool {
        let result = match command {
            Command::Login(name) => match self.manager.login(&name) {
                Ok(pending) => pending.wait().await,
                Err(err) => Err(err),
            },
            Command::Logout => self.manager.logout().wait().await,
            Command::Join { name, positional } => {
                let channel_type = if positional {
                    ChannelType::Positional
                } else {
                    self.manager.settings().default_channel_type
                };
                match self.manager.join(&name, channel_type) {
                    Ok((_, pending)) => pending.wait().await,
                    Err(err) => Err(err),
                }
            }
            Command::Leave => {
                self.recipient = Recipient::Everyone;
                self.manager.leave().wait().await
            }
            Command::To(recipient) => {
                println!("sending to {recipient}");
                self.recipient = recipient;
                Ok(())
            }
            Command::Mute => self.manager.toggle_local_mute().await.map(|_| ()),
            Command::Who => {
                println!("in channel: {}", self.manager.roster_usernames().join(", "));
                println!("can message: {}", self.manager.selectable_users().join(", "));
                Ok(())
            }
            Command::PeerJoin(name) | Command::PeerLeave(name) if self.manager.active_channel().is_none() => {
                println!("join a channel before adding peer {name}");
                Ok(())
            }
            Command::PeerJoin(name) => {
                if let Some(channel) = self.manager.active_channel() {
                    let peer = self.manager.identity_for(&name);
                    self.provider.connect_peer(&peer, channel.channel());
                }
                Ok(())
            }
            Command::PeerLeave(name) => {
                if let Some(channel) = self.manager.active_channel() {
                    let peer = self.manager.identity_for(&name);
                    if !self.provider.disconnect_peer(&peer, channel.channel()) {
                        println!("{name} is not in the channel");
                    }
                }
                Ok(())
            }
            Command::Say(text) => self.manager.send_to(&self.recipient, &text).await,
            Command::Invalid(line) => {
                println!("unrecognised command: {line}");
                Ok(())
            }
            Command::Quit => return false,
        };

        if let Err(err) = result {
            warn!("{err}");
        }
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let provider = Arc::new(LoopbackProvider::new(&settings.token_config())?);
    let manager = SessionManager::new(settings, provider.clone())?;

    let mut events = manager.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("failed to encode event: {err}"),
            }
        }
    });

    let mut repl = Repl {
        manager: Arc::clone(&manager),
        provider,
        recipient: Recipient::Everyone,
    };
    if let Some(username) = args.username {
        repl.run(Command::Login(username)).await;
        if let Some(channel) = args.channel {
            repl.run(Command::Join {
                name: channel,
                positional: false,
            })
            .await;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if !repl.run(command).await {
            break;
        }
    }

    manager.shutdown().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
