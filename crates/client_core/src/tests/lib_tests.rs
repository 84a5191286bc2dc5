use super::*;
use crate::test_support::{drain_events, eventually, next_event, settings, ScriptedProvider};
use shared::{domain::ConnectionState, error::ErrorCode, protocol::RosterChange};

fn loopback_manager() -> (Arc<SessionManager>, Arc<LoopbackProvider>) {
    let settings = settings();
    let provider = Arc::new(LoopbackProvider::new(&settings.token_config()).expect("provider"));
    let manager = SessionManager::new(settings, provider.clone()).expect("manager");
    (manager, provider)
}

fn scripted_manager() -> (Arc<SessionManager>, Arc<ScriptedProvider>) {
    let provider = ScriptedProvider::new();
    let manager = SessionManager::new(settings(), provider.clone()).expect("manager");
    (manager, provider)
}

async fn logged_in_and_joined(manager: &SessionManager, channel: &str) -> Arc<ChannelSession> {
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");
    let (session, pending) = manager
        .join(channel, ChannelType::NonPositional)
        .expect("join starts");
    pending.wait().await.expect("joined");
    session
}

#[tokio::test]
async fn missing_signing_key_fails_at_construction() {
    let provider = ScriptedProvider::new();
    let err = SessionManager::new(ClientSettings::default(), provider)
        .err()
        .expect("no secret configured");
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}

#[tokio::test]
async fn alice_joins_lobby_sees_bob_come_and_go_then_logs_out() {
    let (manager, provider) = loopback_manager();
    let mut rx = manager.subscribe_events();
    let lobby = logged_in_and_joined(&manager, "lobby").await;
    assert_eq!(manager.login_state(), LoginState::LoggedIn);
    assert!(lobby.is_connected());

    manager
        .send_group("hi")
        .expect("connected")
        .wait()
        .await
        .expect("group send succeeds");
    let echoed = next_event(&mut rx, |event| matches!(event, ClientEvent::MessageReceived(_))).await;
    assert!(matches!(
        echoed,
        ClientEvent::MessageReceived(message) if message.sender_name == "alice" && message.text == "hi"
    ));

    let bob = manager.identity_for("bob");
    provider.connect_peer(&bob, lobby.channel());
    eventually("bob in roster", || manager.roster_usernames() == vec!["bob"]).await;
    assert_eq!(manager.selectable_users(), vec!["bob"]);
    assert_eq!(
        lobby.roster().local_participant().map(|p| p.identity),
        Some(manager.identity_for("alice"))
    );

    provider.disconnect_peer(&bob, lobby.channel());
    eventually("bob gone", || manager.roster_usernames().is_empty()).await;
    assert!(manager.selectable_users().is_empty());
    let left = next_event(&mut rx, |event| {
        matches!(event, ClientEvent::RosterChanged { change: RosterChange::Left, .. })
    })
    .await;
    assert!(matches!(left, ClientEvent::RosterChanged { username, .. } if username == "bob"));

    manager.leave().wait().await.expect("leave");
    manager.logout().wait().await.expect("logout");

    assert_eq!(manager.login_state(), LoginState::LoggedOut);
    assert!(lobby.roster().is_empty());
    assert_eq!(manager.pending_directed_count(), 0);
    assert_eq!(manager.hub().subscription_count(), 0);
}

#[tokio::test]
async fn directed_send_to_offline_user_reports_one_failure() {
    let (manager, _provider) = loopback_manager();
    let mut rx = manager.subscribe_events();
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");

    let request_id = manager
        .send_directed("carol", "hello")
        .expect("logged in")
        .wait()
        .await
        .expect("send initiated");

    let failed = next_event(&mut rx, |event| matches!(event, ClientEvent::SendFailed { .. })).await;
    assert_eq!(
        failed,
        ClientEvent::SendFailed {
            original_text: "hello".into()
        }
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let rest = drain_events(&mut rx);
    assert!(!rest
        .iter()
        .any(|event| matches!(event, ClientEvent::SendFailed { .. })));
    assert_eq!(manager.pending_directed_count(), 0);
    assert!(!request_id.as_str().is_empty());
}

#[tokio::test]
async fn queued_directed_messages_are_all_delivered_in_order() {
    let (manager, provider) = loopback_manager();
    let mut rx = manager.subscribe_events();
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");

    let alice = manager.identity_for("alice");
    let bob = manager.identity_for("bob");
    for n in 0..4 {
        provider.enqueue_directed(&bob, &alice, &format!("note {n}"));
    }
    provider.flush_directed(&alice);

    let mut texts = Vec::new();
    while texts.len() < 4 {
        if let ClientEvent::MessageReceived(message) =
            next_event(&mut rx, |event| matches!(event, ClientEvent::MessageReceived(_))).await
        {
            assert!(message.is_directed);
            texts.push(message.text);
        }
    }
    assert_eq!(texts, vec!["note 0", "note 1", "note 2", "note 3"]);
}

#[tokio::test]
async fn leave_during_connect_ends_disconnected_with_nothing_bound() {
    let (manager, provider) = scripted_manager();
    let gate = provider.gate_connect();
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");
    let login_subscriptions = manager.hub().subscription_count();

    let (lobby, pending) = manager
        .join("lobby", ChannelType::NonPositional)
        .expect("join starts");
    manager.leave().wait().await.expect("leave");
    gate.notify_one();
    assert!(pending.wait().await.is_err());

    assert_eq!(lobby.channel_state(), ConnectionState::Disconnected);
    assert_eq!(lobby.subscription_count(), 0);
    assert!(manager.active_channel().is_none());
    assert_eq!(manager.hub().subscription_count(), login_subscriptions);
}

#[tokio::test]
async fn immediate_leave_on_the_loopback_reports_no_error() {
    let (manager, provider) = loopback_manager();
    let mut rx = manager.subscribe_events();
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");

    let (lobby, pending) = manager
        .join("lobby", ChannelType::NonPositional)
        .expect("join starts");
    manager.leave().wait().await.expect("leave succeeds");
    assert!(pending.wait().await.is_err());

    assert_eq!(lobby.channel_state(), ConnectionState::Disconnected);
    assert!(provider.participants(lobby.channel()).is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain_events(&mut rx)
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(_))));
}

#[tokio::test]
async fn one_member_leaving_does_not_disconnect_the_others() {
    let settings = settings();
    let provider = Arc::new(LoopbackProvider::new(&settings.token_config()).expect("provider"));
    let alice = SessionManager::new(settings.clone(), provider.clone()).expect("alice manager");
    let bob = SessionManager::new(settings, provider.clone()).expect("bob manager");
    let mut alice_events = alice.subscribe_events();

    let alice_lobby = logged_in_and_joined(&alice, "lobby").await;
    bob.login("bob")
        .expect("login starts")
        .wait()
        .await
        .expect("bob logged in");
    let (bob_lobby, pending) = bob
        .join("lobby", ChannelType::NonPositional)
        .expect("join starts");
    pending.wait().await.expect("bob joined");

    eventually("alice sees bob", || alice.roster_usernames() == vec!["bob"]).await;
    eventually("bob sees alice", || bob.roster_usernames() == vec!["alice"]).await;
    assert_eq!(
        bob_lobby.roster().local_participant().map(|p| p.identity),
        Some(bob.identity_for("bob"))
    );

    bob.leave().wait().await.expect("bob leaves");
    eventually("bob gone for alice", || alice.roster_usernames().is_empty()).await;

    assert!(alice_lobby.is_connected());
    assert_eq!(alice_lobby.subscription_count(), 3);
    alice
        .send_group("still here")
        .expect("alice is connected")
        .wait()
        .await
        .expect("group send");

    let joins: Vec<String> = drain_events(&mut alice_events)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::RosterChanged {
                username,
                change: RosterChange::Joined,
                ..
            } => Some(username),
            _ => None,
        })
        .collect();
    assert_eq!(joins, vec!["alice", "bob"]);
}

#[tokio::test]
async fn a_burst_of_joins_reaches_the_roster_in_full() {
    let (manager, provider) = loopback_manager();
    let lobby = logged_in_and_joined(&manager, "lobby").await;

    for n in 0..1100 {
        provider.connect_peer(&manager.identity_for(&format!("peer-{n}")), lobby.channel());
    }

    eventually("every peer in the roster", || lobby.roster().len() == 1100).await;
    assert_eq!(provider.participants(lobby.channel()).len(), 1101);
}

#[tokio::test]
async fn repeated_login_is_a_no_op_and_other_users_are_refused() {
    let (manager, provider) = scripted_manager();
    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");

    manager
        .login("alice")
        .expect("same user")
        .wait()
        .await
        .expect("no-op");
    assert!(matches!(
        manager.login("bob"),
        Err(SessionError::AlreadyActive(name)) if name == "alice"
    ));
    assert_eq!(provider.count("login"), 1);
    assert_eq!(
        manager.login_session().map(|s| s.identity().username().to_string()),
        Some("alice".to_string())
    );

    manager.logout().wait().await.expect("logout");
    manager
        .login("bob")
        .expect("slot is free again")
        .wait()
        .await
        .expect("bob logged in");
    assert_eq!(provider.count("login"), 2);
}

#[tokio::test]
async fn service_side_logout_reaches_the_session_through_the_pump() {
    let (manager, provider) = scripted_manager();
    let lobby = logged_in_and_joined(&manager, "lobby").await;

    provider.push(ServiceNotification::LoginStateChanged {
        identity: manager.identity_for("alice"),
        state: LoginState::LoggedOut,
    });

    eventually("logged out by the service", || {
        manager.login_state() == LoginState::LoggedOut
    })
    .await;
    assert_eq!(lobby.channel_state(), ConnectionState::Disconnected);
    assert_eq!(manager.hub().subscription_count(), 0);
    assert_eq!(provider.count("logout"), 0);
}

#[tokio::test]
async fn idle_leave_and_logout_emit_nothing() {
    let (manager, provider) = scripted_manager();
    let mut rx = manager.subscribe_events();

    manager.leave().wait().await.expect("leave");
    manager.logout().wait().await.expect("logout");

    assert!(provider.calls().is_empty());
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn sends_check_preconditions_before_contacting_the_service() {
    let (manager, provider) = scripted_manager();
    assert!(matches!(
        manager.send_group("hi"),
        Err(SessionError::NotAuthenticated(_))
    ));
    assert!(matches!(
        manager.send_directed("bob", "hi"),
        Err(SessionError::NotAuthenticated(_))
    ));

    manager
        .login("alice")
        .expect("login starts")
        .wait()
        .await
        .expect("logged in");
    assert!(matches!(
        manager.send_group("hi"),
        Err(SessionError::NotConnected(_))
    ));
    let err = manager
        .send_to(&Recipient::User("dave".into()), "psst")
        .await
        .expect_err("dave is not in the channel");
    assert!(matches!(err, SessionError::NotConnected(_)));
    assert_eq!(provider.count("directed"), 0);
    assert_eq!(provider.count("group"), 0);
}

#[tokio::test]
async fn send_to_routes_by_recipient() {
    let (manager, provider) = loopback_manager();
    let mut rx = manager.subscribe_events();
    let lobby = logged_in_and_joined(&manager, "lobby").await;
    provider.connect_peer(&manager.identity_for("bob"), lobby.channel());
    eventually("bob selectable", || manager.selectable_users() == vec!["bob"]).await;

    manager
        .send_to(&Recipient::User("bob".into()), "psst")
        .await
        .expect("directed send");
    let sent = next_event(&mut rx, |event| {
        matches!(event, ClientEvent::DirectedMessageSent { .. })
    })
    .await;
    assert!(matches!(
        sent,
        ClientEvent::DirectedMessageSent { recipient, text, .. } if recipient == "bob" && text == "psst"
    ));

    manager
        .send_to(&Recipient::parse("Everyone"), "all")
        .await
        .expect("group send");
    let group = next_event(&mut rx, |event| {
        matches!(event, ClientEvent::MessageReceived(message) if message.text == "all")
    })
    .await;
    assert!(matches!(group, ClientEvent::MessageReceived(message) if !message.is_directed));
}

#[tokio::test]
async fn mute_toggles_without_login_and_is_announced() {
    let (manager, provider) = scripted_manager();
    let mut rx = manager.subscribe_events();

    assert!(manager.toggle_local_mute().await.expect("toggle"));
    assert!(!manager.toggle_local_mute().await.expect("toggle back"));

    assert_eq!(provider.calls(), vec!["mute true", "mute false"]);
    assert_eq!(
        drain_events(&mut rx),
        vec![
            ClientEvent::LocalMuteChanged { muted: true },
            ClientEvent::LocalMuteChanged { muted: false },
        ]
    );
}

#[tokio::test]
async fn shutdown_logs_out_and_refuses_further_work() {
    let (manager, provider) = scripted_manager();
    let lobby = logged_in_and_joined(&manager, "lobby").await;

    manager.shutdown().await;

    assert!(manager.is_shut_down());
    assert_eq!(manager.login_state(), LoginState::LoggedOut);
    assert_eq!(lobby.channel_state(), ConnectionState::Disconnected);
    assert_eq!(manager.hub().subscription_count(), 0);
    assert_eq!(provider.count("disconnect lobby"), 1);
    assert_eq!(provider.count("logout alice"), 1);

    for err in [
        manager.login("alice").err(),
        manager.set_local_mute(true).await.err(),
        manager.logout().wait().await.err(),
    ] {
        assert_eq!(
            err,
            Some(SessionError::InvalidConfiguration(
                "session manager is shut down".into()
            ))
        );
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn events_serialize_as_tagged_json() {
    let (manager, _provider) = scripted_manager();
    let mut rx = manager.subscribe_events();
    manager.set_local_mute(true).await.expect("mute");

    let event = next_event(&mut rx, |_| true).await;
    let json = serde_json::to_value(&event).expect("encode");
    assert_eq!(json["type"], "local_mute_changed");
    assert_eq!(json["payload"]["muted"], true);
}

#[test]
fn recipient_parsing_treats_everyone_specially() {
    assert_eq!(Recipient::parse(" everyone "), Recipient::Everyone);
    assert_eq!(Recipient::parse(""), Recipient::Everyone);
    assert_eq!(Recipient::parse("bob"), Recipient::User("bob".into()));
    assert_eq!(Recipient::User("bob".into()).to_string(), "bob");
}
