use std::{collections::HashSet, str::FromStr, sync::Arc};

use reqwest::header::HeaderMap;
use tracing::{info, warn};
use url::Url;

use crate::{
    auth::{AuthProvider, CredentialScope},
    error::{Error, Result},
    http::{probe_streamable, SseTransport, StreamableHttpTransport},
    transport::{Transport, TransportStream},
};

/// Which transport family to try first, and whether to fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportStrategy {
    SseOnly,
    HttpOnly,
    SseFirst,
    #[default]
    HttpFirst,
}

impl TransportStrategy {
    fn initial(self) -> TransportKind {
        match self {
            TransportStrategy::SseOnly | TransportStrategy::SseFirst => TransportKind::Sse,
            TransportStrategy::HttpOnly | TransportStrategy::HttpFirst => {
                TransportKind::StreamableHttp
            }
        }
    }

    fn allows_fallback(self) -> bool {
        matches!(self, TransportStrategy::SseFirst | TransportStrategy::HttpFirst)
    }
}

impl FromStr for TransportStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sse-only" => Ok(TransportStrategy::SseOnly),
            "http-only" => Ok(TransportStrategy::HttpOnly),
            "sse-first" => Ok(TransportStrategy::SseFirst),
            "http-first" => Ok(TransportStrategy::HttpFirst),
            other => Err(format!(
                "unknown transport strategy {other:?} (expected sse-only, http-only, sse-first or http-first)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Sse,
    StreamableHttp,
}

impl TransportKind {
    fn other(self) -> Self {
        match self {
            TransportKind::Sse => TransportKind::StreamableHttp,
            TransportKind::StreamableHttp => TransportKind::Sse,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sse => "SSE".fmt(f),
            TransportKind::StreamableHttp => "streamable HTTP".fmt(f),
        }
    }
}

/// Connects to the remote, retrying across transport families and through
/// one authorization round. Each retry class may fire at most once per
/// connection, tracked in a reasons set; a recurrence is fatal.
pub struct TransportSelector {
    server_url: Url,
    headers: HeaderMap,
    strategy: TransportStrategy,
    provider: Arc<dyn AuthProvider>,
    client: reqwest::Client,
    /// Separate client instance for the streamable capability probe, which
    /// must not share connection state with the real transport.
    probe_client: reqwest::Client,
    skip_browser_auth: bool,
}

const REASON_FALLBACK: &str = "falling-back-to-alternate-transport";
const REASON_AUTH: &str = "authenticating";

impl TransportSelector {
    pub fn new(
        server_url: Url,
        headers: HeaderMap,
        strategy: TransportStrategy,
        provider: Arc<dyn AuthProvider>,
        client: reqwest::Client,
        probe_client: reqwest::Client,
        skip_browser_auth: bool,
    ) -> Self {
        Self {
            server_url,
            headers,
            strategy,
            provider,
            client,
            probe_client,
            skip_browser_auth,
        }
    }

    pub async fn connect(&self) -> Result<Box<dyn TransportStream>> {
        let mut recursion_reasons: HashSet<&'static str> = HashSet::new();
        let mut kind = self.strategy.initial();

        loop {
            match self.attempt(kind).await {
                Ok(stream) => {
                    info!("connected to {} over {kind}", self.server_url);
                    return Ok(stream);
                }
                Err(e) if e.is_transport_fallback() && self.strategy.allows_fallback() => {
                    if !recursion_reasons.insert(REASON_FALLBACK) {
                        return Err(Error::Transport(
                            "Already attempted transport fallback.".into(),
                        ));
                    }
                    warn!("{kind} transport failed ({e}); retrying over {}", kind.other());
                    kind = kind.other();
                }
                Err(Error::Unauthorized(context)) => {
                    if !recursion_reasons.insert(REASON_AUTH) {
                        return Err(Error::AuthorizationFailed(
                            "remote still rejects our credentials after re-authorization".into(),
                        ));
                    }
                    info!("remote requires authorization ({context})");
                    if self.skip_browser_auth {
                        // Secondary: the leader runs the browser flow and this
                        // process picks the bundle up from disk.
                        self.provider.authorize().await?;
                    } else {
                        self.provider
                            .invalidate_credentials(CredentialScope::Tokens)?;
                        self.provider.ensure_access_token().await?;
                    }
                }
                Err(e) => return Err(e.enrich()),
            }
        }
    }

    async fn attempt(&self, kind: TransportKind) -> Result<Box<dyn TransportStream>> {
        match kind {
            TransportKind::Sse => {
                let mut transport = SseTransport::new(
                    self.server_url.clone(),
                    self.headers.clone(),
                    self.client.clone(),
                    self.provider.clone(),
                );
                transport.connect().await?;
                Box::new(transport).framed()
            }
            TransportKind::StreamableHttp => {
                // Opening the streamable transport sends nothing, so the
                // server's real capability is probed with a throwaway
                // request first.
                let access_token = self.provider.tokens()?.map(|t| t.access_token);
                probe_streamable(
                    &self.probe_client,
                    &self.server_url,
                    &self.headers,
                    access_token.as_deref(),
                )
                .await?;

                let mut transport = StreamableHttpTransport::new(
                    self.server_url.clone(),
                    self.headers.clone(),
                    self.client.clone(),
                    self.provider.clone(),
                );
                transport.connect().await?;
                Box::new(transport).framed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "sse-only".parse::<TransportStrategy>().unwrap(),
            TransportStrategy::SseOnly
        );
        assert_eq!(
            "http-first".parse::<TransportStrategy>().unwrap(),
            TransportStrategy::HttpFirst
        );
        assert!("tcp".parse::<TransportStrategy>().is_err());
    }

    #[test]
    fn test_strategy_initial_and_fallback() {
        assert_eq!(TransportStrategy::SseFirst.initial(), TransportKind::Sse);
        assert_eq!(
            TransportStrategy::HttpFirst.initial(),
            TransportKind::StreamableHttp
        );
        assert!(TransportStrategy::HttpFirst.allows_fallback());
        assert!(TransportStrategy::SseFirst.allows_fallback());
        assert!(!TransportStrategy::HttpOnly.allows_fallback());
        assert!(!TransportStrategy::SseOnly.allows_fallback());
    }

    #[test]
    fn test_default_strategy() {
        assert_eq!(TransportStrategy::default(), TransportStrategy::HttpFirst);
    }

    #[test]
    fn test_kind_other_is_involution() {
        assert_eq!(TransportKind::Sse.other(), TransportKind::StreamableHttp);
        assert_eq!(TransportKind::Sse.other().other(), TransportKind::Sse);
    }
}
