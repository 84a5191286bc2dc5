use super::*;
use chrono::TimeZone;
use jsonwebtoken::{decode, DecodingKey, Validation};
use shared::domain::ChannelType;

fn config() -> TokenIssuerConfig {
    TokenIssuerConfig {
        issuer: "acme".into(),
        secret_key: Some("devsecret".into()),
    }
}

fn alice() -> Identity {
    Identity::new("acme", "alice", "chat.example")
}

fn lobby() -> ChannelRef {
    ChannelRef::new("acme", "lobby", "chat.example", ChannelType::NonPositional)
}

#[test]
fn missing_signing_key_is_invalid_configuration() {
    let cfg = TokenIssuerConfig {
        issuer: "acme".into(),
        secret_key: None,
    };
    assert!(matches!(
        TokenIssuer::new(&cfg),
        Err(SessionError::InvalidConfiguration(_))
    ));

    let blank = TokenIssuerConfig {
        issuer: "acme".into(),
        secret_key: Some("   ".into()),
    };
    assert!(matches!(
        TokenVerifier::new(&blank),
        Err(SessionError::InvalidConfiguration(_))
    ));
}

#[test]
fn join_token_claims_contain_channel_audience() {
    let issuer = TokenIssuer::new(&config()).expect("issuer");
    let scope = TokenScope::Join {
        identity: alice(),
        channel: lobby(),
    };
    let token = issuer.issue(&scope, DEFAULT_TOKEN_VALIDITY).expect("token");

    let mut validation = Validation::default();
    validation.validate_aud = false;
    let decoded = decode::<serde_json::Value>(
        token.as_str(),
        &DecodingKey::from_secret(b"devsecret"),
        &validation,
    )
    .expect("decode");

    assert_eq!(decoded.claims["iss"], "acme");
    assert_eq!(decoded.claims["sub"], "acme:alice@chat.example");
    assert_eq!(decoded.claims["aud"], "acme:channel:lobby@chat.example");
    assert_eq!(decoded.claims["act"], "join");
    assert_eq!(
        decoded.claims["exp"].as_i64().expect("exp") - decoded.claims["iat"].as_i64().expect("iat"),
        90
    );
}

#[test]
fn issuing_is_deterministic_for_a_fixed_clock() {
    let issuer = TokenIssuer::new(&config()).expect("issuer");
    let scope = TokenScope::Login { identity: alice() };
    let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");

    let first = issuer.issue_at(&scope, DEFAULT_TOKEN_VALIDITY, now).expect("first");
    let second = issuer.issue_at(&scope, DEFAULT_TOKEN_VALIDITY, now).expect("second");

    assert_eq!(first, second);
    assert_eq!(first.expires_at(), now + Duration::seconds(90));
    assert!(!first.is_expired_at(now));
    assert!(first.is_expired_at(now + Duration::seconds(91)));
}

#[test]
fn verifier_accepts_fresh_token_for_matching_scope() {
    let issuer = TokenIssuer::new(&config()).expect("issuer");
    let verifier = TokenVerifier::new(&config()).expect("verifier");
    let scope = TokenScope::Login { identity: alice() };
    let token = issuer.issue(&scope, DEFAULT_TOKEN_VALIDITY).expect("token");

    let claims = verifier.verify(&token, &scope).expect("verify");
    assert_eq!(claims.act, TokenAction::Login);
    assert_eq!(claims.aud, None);
}

#[test]
fn verifier_rejects_expired_token() {
    let issuer = TokenIssuer::new(&config()).expect("issuer");
    let verifier = TokenVerifier::new(&config()).expect("verifier");
    let scope = TokenScope::Login { identity: alice() };
    let issued_at = Utc::now() - Duration::seconds(600);
    let token = issuer
        .issue_at(&scope, DEFAULT_TOKEN_VALIDITY, issued_at)
        .expect("token");

    assert!(matches!(
        verifier.verify(&token, &scope),
        Err(SessionError::NotAuthenticated(_))
    ));
}

#[test]
fn verifier_rejects_scope_mismatch_and_foreign_secret() {
    let issuer = TokenIssuer::new(&config()).expect("issuer");
    let verifier = TokenVerifier::new(&config()).expect("verifier");
    let login = TokenScope::Login { identity: alice() };
    let token = issuer.issue(&login, DEFAULT_TOKEN_VALIDITY).expect("token");

    let join = TokenScope::Join {
        identity: alice(),
        channel: lobby(),
    };
    assert!(verifier.verify(&token, &join).is_err());

    let bob = TokenScope::Login {
        identity: Identity::new("acme", "bob", "chat.example"),
    };
    assert!(verifier.verify(&token, &bob).is_err());

    let other = TokenVerifier::new(&TokenIssuerConfig {
        issuer: "acme".into(),
        secret_key: Some("othersecret".into()),
    })
    .expect("verifier");
    assert!(other.verify(&token, &login).is_err());
}
