use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{channel::mpsc, Sink, Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    StatusCode,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    auth::AuthProvider,
    error::{Error, Result},
    jsonrpc::JSONRPCMessage,
    transport::{Transport, TransportStream},
};

const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How long the SSE transport waits for the server's `endpoint` event.
const ENDPOINT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a reqwest client for remote traffic. Environment proxies are only
/// honored when the user opted in.
pub fn build_http_client(enable_proxy: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);
    if !enable_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))
}

fn bearer_headers(base: &HeaderMap, token: Option<&str>) -> HeaderMap {
    let mut headers = base.clone();
    if let Some(token) = token {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers.insert(
        "MCP-Protocol-Version",
        HeaderValue::from_static(MCP_PROTOCOL_VERSION),
    );
    headers
}

/// Map a non-success response status to the error class the transport
/// selector dispatches on.
fn status_error(context: &str, status: StatusCode) -> Error {
    if status == StatusCode::UNAUTHORIZED {
        Error::Unauthorized(format!("{context} rejected with HTTP 401"))
    } else {
        Error::Transport(format!("{context} failed with status: {status}"))
    }
}

/// Stream wrapper bridging the channel pair produced by either remote
/// transport. Dropping it aborts the background pump tasks.
struct RemoteTransportStream {
    sender: mpsc::UnboundedSender<JSONRPCMessage>,
    receiver: mpsc::UnboundedReceiver<JSONRPCMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for RemoteTransportStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Stream for RemoteTransportStream {
    type Item = Result<JSONRPCMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_next_unpin(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<JSONRPCMessage> for RemoteTransportStream {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: JSONRPCMessage) -> Result<()> {
        self.sender
            .unbounded_send(item)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl TransportStream for RemoteTransportStream {}

/// Streamable-HTTP transport: every message is POSTed to the endpoint and
/// responses arrive either as a JSON body or as an SSE-framed body on the
/// same request. An optional GET stream carries server-initiated messages.
pub struct StreamableHttpTransport {
    endpoint: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    provider: Arc<dyn AuthProvider>,
    access_token: Option<String>,
    incoming_tx: Option<mpsc::UnboundedSender<JSONRPCMessage>>,
    incoming_rx: Option<mpsc::UnboundedReceiver<JSONRPCMessage>>,
    get_stream_task: Option<JoinHandle<()>>,
}

impl StreamableHttpTransport {
    pub fn new(
        endpoint: Url,
        headers: HeaderMap,
        client: reqwest::Client,
        provider: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            endpoint,
            headers,
            client,
            provider,
            access_token: None,
            incoming_tx: None,
            incoming_rx: None,
            get_stream_task: None,
        }
    }

    /// Open the optional GET stream for server-initiated messages. Servers
    /// that do not offer one answer 405, which is not an error here.
    async fn connect_get_stream(&mut self) -> Result<()> {
        let mut headers = bearer_headers(&self.headers, self.access_token.as_deref());
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(self.endpoint.clone())
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            debug!("server offers no standalone GET stream");
            return Ok(());
        }
        if !status.is_success() {
            return Err(status_error("GET stream", status));
        }

        let sender = self
            .incoming_tx
            .as_ref()
            .ok_or(Error::TransportDisconnected)?
            .clone();
        let mut events = response.bytes_stream().eventsource();
        self.get_stream_task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if let Ok(msg) = serde_json::from_str::<JSONRPCMessage>(&event.data) {
                            if sender.unbounded_send(msg).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("GET stream ended: {e}");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.get_stream_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&mut self) -> Result<()> {
        debug!("connecting streamable HTTP transport to {}", self.endpoint);
        // A cached token is fine here; only SSE re-reads per request.
        self.access_token = self.provider.tokens()?.map(|t| t.access_token);

        let (tx, rx) = mpsc::unbounded();
        self.incoming_tx = Some(tx);
        self.incoming_rx = Some(rx);

        if let Err(e) = self.connect_get_stream().await {
            match e {
                Error::Unauthorized(_) => return Err(e),
                other => debug!("standalone GET stream unavailable: {other}"),
            }
        }
        Ok(())
    }

    fn framed(mut self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let incoming_tx = self.incoming_tx.take().ok_or(Error::TransportDisconnected)?;
        let incoming_rx = self.incoming_rx.take().ok_or(Error::TransportDisconnected)?;
        let get_stream_task = self.get_stream_task.take();

        let endpoint = self.endpoint.clone();
        let client = self.client.clone();
        let base_headers = self.headers.clone();
        let access_token = self.access_token.clone();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded::<JSONRPCMessage>();
        let post_task = tokio::spawn(async move {
            let mut session_id: Option<String> = None;

            while let Some(msg) = outgoing_rx.next().await {
                let mut headers = bearer_headers(&base_headers, access_token.as_deref());
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert(
                    ACCEPT,
                    HeaderValue::from_static("application/json, text/event-stream"),
                );
                if let Some(sid) = &session_id {
                    if let Ok(value) = HeaderValue::from_str(sid) {
                        headers.insert("Mcp-Session-Id", value);
                    }
                }

                let is_initialize =
                    matches!(&msg, JSONRPCMessage::Request(req) if req.method == "initialize");

                let response = match client
                    .post(endpoint.clone())
                    .headers(headers)
                    .json(&msg)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        error!("failed to POST message to {endpoint}: {e}");
                        continue;
                    }
                };

                if is_initialize {
                    if let Some(sid) = response
                        .headers()
                        .get("Mcp-Session-Id")
                        .and_then(|v| v.to_str().ok())
                    {
                        debug!("remote assigned session id {sid}");
                        session_id = Some(sid.to_string());
                    }
                }

                let status = response.status();
                if !status.is_success() {
                    error!("remote rejected message with status {status}");
                    continue;
                }

                // Requests yield a body: plain JSON, or an SSE-framed series
                // of messages ending with the response.
                if matches!(&msg, JSONRPCMessage::Request(_)) {
                    let is_event_stream = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.contains("text/event-stream"))
                        .unwrap_or(false);

                    if is_event_stream {
                        let mut events = response.bytes_stream().eventsource();
                        while let Some(event) = events.next().await {
                            match event {
                                Ok(event) => {
                                    match serde_json::from_str::<JSONRPCMessage>(&event.data) {
                                        Ok(parsed) => {
                                            let done = matches!(
                                                parsed,
                                                JSONRPCMessage::Response(_)
                                                    | JSONRPCMessage::Error(_)
                                            );
                                            if incoming_tx.unbounded_send(parsed).is_err() {
                                                return;
                                            }
                                            if done {
                                                break;
                                            }
                                        }
                                        Err(e) => warn!("unparseable SSE body event: {e}"),
                                    }
                                }
                                Err(e) => {
                                    warn!("response event stream ended early: {e}");
                                    break;
                                }
                            }
                        }
                    } else {
                        match response.json::<JSONRPCMessage>().await {
                            Ok(parsed) => {
                                if incoming_tx.unbounded_send(parsed).is_err() {
                                    return;
                                }
                            }
                            Err(e) => error!("failed to parse response body: {e}"),
                        }
                    }
                }
            }
        });

        let mut tasks = vec![post_task];
        if let Some(task) = get_stream_task {
            tasks.push(task);
        }

        Ok(Box::new(RemoteTransportStream {
            sender: outgoing_tx,
            receiver: incoming_rx,
            tasks,
        }))
    }
}

/// Probe the streamable endpoint with a throwaway request so the server
/// reveals whether it actually speaks this transport; opening the transport
/// alone sends nothing. Runs on its own client instance.
pub async fn probe_streamable(
    client: &reqwest::Client,
    endpoint: &Url,
    headers: &HeaderMap,
    access_token: Option<&str>,
) -> Result<()> {
    let mut probe_headers = bearer_headers(headers, access_token);
    probe_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    probe_headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );

    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": "capability-probe",
        "method": "initialize",
        "params": {
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        }
    });

    let response = client
        .post(endpoint.clone())
        .headers(probe_headers)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
        return Err(Error::Transport(format!(
            "streamable HTTP probe failed with status: {status}"
        )));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized("capability probe".into()));
    }
    Ok(())
}

/// Legacy SSE transport: a long-lived GET event source for server→client
/// traffic, with client→server messages POSTed to the endpoint announced in
/// the server's `endpoint` event.
pub struct SseTransport {
    endpoint: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    provider: Arc<dyn AuthProvider>,
    message_endpoint: Option<Url>,
    incoming_rx: Option<mpsc::UnboundedReceiver<JSONRPCMessage>>,
    event_task: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(
        endpoint: Url,
        headers: HeaderMap,
        client: reqwest::Client,
        provider: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            endpoint,
            headers,
            client,
            provider,
            message_endpoint: None,
            incoming_rx: None,
            event_task: None,
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        debug!("connecting SSE transport to {}", self.endpoint);

        // Tokens are re-read from the provider for every event-source
        // request: a bundle refreshed mid-session must be picked up here.
        let access_token = self.provider.tokens()?.map(|t| t.access_token);
        let mut headers = bearer_headers(&self.headers, access_token.as_deref());
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(self.endpoint.clone())
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("SSE connection", status));
        }

        let mut events = response.bytes_stream().eventsource();

        // The server's first event names the POST endpoint for this session.
        let endpoint_event = tokio::time::timeout(ENDPOINT_EVENT_TIMEOUT, async {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) if event.event == "endpoint" => return Some(event.data),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("SSE stream errored before endpoint event: {e}");
                        return None;
                    }
                }
            }
            None
        })
        .await
        .map_err(|_| Error::Transport("timed out waiting for SSE endpoint event".into()))?
        .ok_or_else(|| Error::Transport("SSE stream closed before endpoint event".into()))?;

        let message_endpoint = self
            .endpoint
            .join(endpoint_event.trim())
            .map_err(|e| Error::Transport(format!("invalid SSE endpoint event: {e}")))?;
        debug!("SSE message endpoint: {message_endpoint}");
        self.message_endpoint = Some(message_endpoint);

        let (tx, rx) = mpsc::unbounded();
        self.incoming_rx = Some(rx);
        self.event_task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if let Ok(msg) = serde_json::from_str::<JSONRPCMessage>(&event.data) {
                            if tx.unbounded_send(msg).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("SSE stream ended: {e}");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    fn framed(mut self: Box<Self>) -> Result<Box<dyn TransportStream>> {
        let incoming_rx = self.incoming_rx.take().ok_or(Error::TransportDisconnected)?;
        let event_task = self.event_task.take().ok_or(Error::TransportDisconnected)?;
        let message_endpoint = self
            .message_endpoint
            .clone()
            .ok_or(Error::TransportDisconnected)?;

        let client = self.client.clone();
        let base_headers = self.headers.clone();
        let provider = self.provider.clone();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded::<JSONRPCMessage>();
        let post_task = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.next().await {
                let access_token = provider
                    .tokens()
                    .ok()
                    .flatten()
                    .map(|t| t.access_token);
                let mut headers = bearer_headers(&base_headers, access_token.as_deref());
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

                match client
                    .post(message_endpoint.clone())
                    .headers(headers)
                    .json(&msg)
                    .send()
                    .await
                {
                    Ok(response) if !response.status().is_success() => {
                        error!(
                            "SSE message endpoint rejected message with status {}",
                            response.status()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to POST message to SSE endpoint: {e}"),
                }
            }
        });

        Ok(Box::new(RemoteTransportStream {
            sender: outgoing_tx,
            receiver: incoming_rx,
            tasks: vec![post_task, event_task],
        }))
    }
}
