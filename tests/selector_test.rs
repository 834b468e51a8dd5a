//! Transport strategy selection, fallback, and unauthorized handling
//! against mocked remotes.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_remote::auth::{AuthProvider, CredentialScope};
use mcp_remote::error::{Error, Result};
use mcp_remote::selector::{TransportSelector, TransportStrategy};
use mcp_remote::store::TokenBundle;

/// Provider stub: hands out a configured token once "authorized", without
/// any browser or disk machinery.
struct StubProvider {
    token: Mutex<Option<String>>,
    granted_token: Option<String>,
    authorizations: AtomicUsize,
}

impl StubProvider {
    fn new(current: Option<&str>, granted: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(current.map(str::to_string)),
            granted_token: granted.map(str::to_string),
            authorizations: AtomicUsize::new(0),
        })
    }

    fn bundle(token: String) -> TokenBundle {
        TokenBundle {
            access_token: token,
            token_type: "Bearer".into(),
            expires_in: Some(3600.0),
            refresh_token: None,
            scope: None,
        }
    }
}

#[async_trait]
impl AuthProvider for StubProvider {
    fn tokens(&self) -> Result<Option<TokenBundle>> {
        Ok(self.token.lock().unwrap().clone().map(Self::bundle))
    }

    async fn ensure_access_token(&self) -> Result<String> {
        if let Some(token) = self.token.lock().unwrap().clone() {
            return Ok(token);
        }
        Ok(self.authorize().await?.access_token)
    }

    async fn authorize(&self) -> Result<TokenBundle> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        let granted = self
            .granted_token
            .clone()
            .ok_or_else(|| Error::AuthorizationFailed("stub has nothing to grant".into()))?;
        *self.token.lock().unwrap() = Some(granted.clone());
        Ok(Self::bundle(granted))
    }

    async fn finish_auth(&self, _code: &str) -> Result<TokenBundle> {
        self.authorize().await
    }

    fn invalidate_credentials(&self, _scope: CredentialScope) -> Result<()> {
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}

fn selector(
    server: &MockServer,
    strategy: TransportStrategy,
    provider: Arc<StubProvider>,
) -> TransportSelector {
    TransportSelector::new(
        Url::parse(&server.uri()).unwrap(),
        HeaderMap::new(),
        strategy,
        provider,
        reqwest::Client::new(),
        reqwest::Client::new(),
        false,
    )
}

const SSE_HELLO: &str = "event: endpoint\ndata: /message\n\n";

fn sse_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(SSE_HELLO, "text/event-stream")
}

#[tokio::test]
async fn test_http_first_falls_back_to_sse_on_405() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(sse_response())
        .mount(&server)
        .await;

    let provider = StubProvider::new(Some("T"), None);
    let stream = selector(&server, TransportStrategy::HttpFirst, provider)
        .connect()
        .await;
    assert!(stream.is_ok(), "{:?}", stream.err().map(|e| e.to_string()));
}

#[tokio::test]
async fn test_second_fallback_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let provider = StubProvider::new(Some("T"), None);
    let err = selector(&server, TransportStrategy::HttpFirst, provider)
        .connect()
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("Already attempted transport fallback."),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_only_strategies_never_fall_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let provider = StubProvider::new(Some("T"), None);
    let err = selector(&server, TransportStrategy::SseOnly, provider)
        .connect()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("405"), "unexpected error: {err}");
    assert!(!err.to_string().contains("Already attempted"));

    // The streamable endpoint was never probed.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.method != "POST"));
}

#[tokio::test]
async fn test_unauthorized_triggers_exactly_one_authorization() {
    let server = MockServer::start().await;
    // With the granted token the probe succeeds; without it, 401.
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("authorization", "Bearer GRANTED"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": "capability-probe", "result": {}
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(401))
        .with_priority(10)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let provider = StubProvider::new(None, Some("GRANTED"));
    let stream = selector(&server, TransportStrategy::HttpOnly, provider.clone())
        .connect()
        .await;
    assert!(stream.is_ok(), "{:?}", stream.err().map(|e| e.to_string()));
    assert_eq!(provider.authorizations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_persistent_unauthorized_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    // Authorization "succeeds" but the remote keeps rejecting the result.
    let provider = StubProvider::new(None, Some("STILL_BAD"));
    let err = selector(&server, TransportStrategy::HttpOnly, provider.clone())
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)), "got {err}");
    assert_eq!(provider.authorizations.load(Ordering::SeqCst), 1);
}
