//! Dynamic client registration (RFC 7591) against a mocked endpoint.

use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_remote::auth::{register_client, RegistrationMetadata};
use mcp_remote::error::Error;

#[tokio::test]
async fn test_registration_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .and(body_partial_json(serde_json::json!({
            "client_name": "MCP CLI Proxy",
            "token_endpoint_auth_method": "none",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "client_id": "generated-id",
            "client_secret": null,
            "redirect_uris": ["http://localhost:4711/oauth/callback"],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "client_name": "MCP CLI Proxy",
        })))
        .mount(&server)
        .await;

    let endpoint = Url::parse(&format!("{}/register", server.uri())).unwrap();
    let metadata = RegistrationMetadata::for_redirect("http://localhost:4711/oauth/callback");
    let registration = register_client(&reqwest::Client::new(), &endpoint, &metadata)
        .await
        .unwrap();

    assert_eq!(registration.client_id, "generated-id");
    assert!(registration.client_secret.is_none());
    assert_eq!(
        registration.redirect_uris,
        vec!["http://localhost:4711/oauth/callback"]
    );
}

#[tokio::test]
async fn test_registration_error_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_redirect_uri",
            "error_description": "loopback only",
        })))
        .mount(&server)
        .await;

    let endpoint = Url::parse(&format!("{}/register", server.uri())).unwrap();
    let metadata = RegistrationMetadata::for_redirect("https://not-loopback.example/cb");
    let err = register_client(&reqwest::Client::new(), &endpoint, &metadata)
        .await
        .unwrap_err();

    match err {
        Error::AuthorizationFailed(message) => {
            assert!(message.contains("invalid_redirect_uri"));
            assert!(message.contains("loopback only"));
        }
        other => panic!("expected AuthorizationFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_registration_opaque_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
        .mount(&server)
        .await;

    let endpoint = Url::parse(&format!("{}/register", server.uri())).unwrap();
    let metadata = RegistrationMetadata::for_redirect("http://localhost:1/cb");
    let err = register_client(&reqwest::Client::new(), &endpoint, &metadata)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
}
