//! Classical (non-PKCE) OAuth flow against a mocked token endpoint.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_remote::auth::{AuthProvider, ClassicOAuthProvider, CredentialScope};
use mcp_remote::callback::{CallbackServer, DEFAULT_AUTH_TIMEOUT, DEFAULT_CALLBACK_PATH};
use mcp_remote::discovery::OAuthEndpoints;
use mcp_remote::error::Error;
use mcp_remote::store::{names, ClientRegistration, CredentialStore, TokenBundle};

const FP: &str = "0123456789abcdef0123456789abcdef";

fn registration() -> ClientRegistration {
    ClientRegistration {
        client_id: "A".into(),
        client_secret: Some("B".into()),
        redirect_uris: vec!["http://localhost:3334/oauth/callback".into()],
        token_endpoint_auth_method: None,
        grant_types: vec![],
        response_types: vec![],
        client_name: None,
        client_uri: None,
        software_id: None,
        software_version: None,
    }
}

async fn provider(
    tmp: &TempDir,
    token_server: &MockServer,
    skip_browser_auth: bool,
) -> ClassicOAuthProvider {
    let callback = Arc::new(
        CallbackServer::bind(0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap(),
    );
    ClassicOAuthProvider::new(
        CredentialStore::at(tmp.path().to_path_buf()),
        FP.into(),
        registration(),
        OAuthEndpoints {
            authorization_endpoint: Url::parse(&format!("{}/authorize", token_server.uri()))
                .unwrap(),
            token_endpoint: Url::parse(&format!("{}/token", token_server.uri())).unwrap(),
            registration_endpoint: None,
        },
        "http://localhost:3334/oauth/callback".into(),
        None,
        reqwest::Client::new(),
        callback,
        skip_browser_auth,
    )
}

fn store(tmp: &TempDir) -> CredentialStore {
    CredentialStore::at(tmp.path().to_path_buf())
}

#[tokio::test]
async fn test_exchange_posts_credentials_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=xyz"))
        .and(body_string_contains("client_id=A"))
        .and(body_string_contains("client_secret=B"))
        .and(body_string_contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A3334%2Foauth%2Fcallback",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T",
            "token_type": "Bearer",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;

    let tokens = provider.exchange("xyz").await.unwrap();
    assert_eq!(tokens.access_token, "T");
    assert_eq!(tokens.expires_in, Some(3600.0));

    let persisted: TokenBundle = store(&tmp).get_json(FP, names::TOKENS).unwrap().unwrap();
    assert_eq!(persisted, tokens);
}

#[tokio::test]
async fn test_exchange_failure_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;

    match provider.exchange("bad").await.unwrap_err() {
        Error::TokenExchangeFailed { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "invalid_grant");
        }
        other => panic!("expected TokenExchangeFailed, got {other}"),
    }
    // Nothing persisted on failure.
    assert!(store(&tmp)
        .get_json::<TokenBundle>(FP, names::TOKENS)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_refresh_preserves_missing_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=R"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T2",
            "token_type": "Bearer",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;
    store(&tmp)
        .put_json(
            FP,
            names::TOKENS,
            &TokenBundle {
                access_token: "T1".into(),
                token_type: "Bearer".into(),
                expires_in: Some(-1.0),
                refresh_token: Some("R".into()),
                scope: None,
            },
        )
        .unwrap();

    let refreshed = provider.refresh().await.unwrap();
    assert_eq!(refreshed.access_token, "T2");
    // The endpoint omitted refresh_token, so the old one survives.
    assert_eq!(refreshed.refresh_token.as_deref(), Some("R"));
}

#[tokio::test]
async fn test_refresh_without_refresh_token_fails() {
    let server = MockServer::start().await;
    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;

    assert!(matches!(
        provider.refresh().await.unwrap_err(),
        Error::NoRefreshToken
    ));
}

#[tokio::test]
async fn test_ensure_returns_current_token_without_traffic() {
    let server = MockServer::start().await;
    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;
    store(&tmp)
        .put_json(
            FP,
            names::TOKENS,
            &TokenBundle {
                access_token: "CURRENT".into(),
                token_type: "Bearer".into(),
                expires_in: Some(3600.0),
                refresh_token: None,
                scope: None,
            },
        )
        .unwrap();

    assert_eq!(provider.ensure_access_token().await.unwrap(), "CURRENT");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ensure_refreshes_expired_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "FRESH",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "R2",
        })))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;
    store(&tmp)
        .put_json(
            FP,
            names::TOKENS,
            &TokenBundle {
                access_token: "STALE".into(),
                token_type: "Bearer".into(),
                expires_in: Some(-1.0),
                refresh_token: Some("R".into()),
                scope: None,
            },
        )
        .unwrap();

    assert_eq!(provider.ensure_access_token().await.unwrap(), "FRESH");
    let persisted: TokenBundle = store(&tmp).get_json(FP, names::TOKENS).unwrap().unwrap();
    assert_eq!(persisted.refresh_token.as_deref(), Some("R2"));
}

#[tokio::test]
async fn test_secondary_waits_for_tokens_from_disk() {
    let server = MockServer::start().await;
    let tmp = TempDir::new().unwrap();
    // No tokens anywhere yet: ensure falls through to authorize, which for
    // a secondary means waiting for the leader's write to appear on disk.
    let provider = provider(&tmp, &server, true).await;

    let writer_store = store(&tmp);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        writer_store
            .put_json(
                FP,
                names::TOKENS,
                &TokenBundle {
                    access_token: "FROM_LEADER".into(),
                    token_type: "Bearer".into(),
                    expires_in: Some(3600.0),
                    refresh_token: None,
                    scope: None,
                },
            )
            .unwrap();
    });

    let token = provider.ensure_access_token().await.unwrap();
    assert_eq!(token, "FROM_LEADER");
    // The secondary produced no token-endpoint traffic at all.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalidate_all_then_tokens_absent() {
    let server = MockServer::start().await;
    let tmp = TempDir::new().unwrap();
    let provider = provider(&tmp, &server, false).await;
    store(&tmp)
        .put_json(
            FP,
            names::TOKENS,
            &TokenBundle {
                access_token: "T".into(),
                token_type: "Bearer".into(),
                expires_in: None,
                refresh_token: None,
                scope: None,
            },
        )
        .unwrap();

    provider.invalidate_credentials(CredentialScope::All).unwrap();
    assert!(provider.tokens().unwrap().is_none());
}
