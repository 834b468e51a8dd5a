use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Authorization-server endpoints for a remote.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub registration_endpoint: Option<Url>,
}

impl OAuthEndpoints {
    /// `<origin>/oauth/authorize` and `<origin>/oauth/token`, always usable
    /// when discovery comes up empty.
    pub fn fallback(server_url: &Url) -> Result<Self> {
        let origin = server_url
            .origin()
            .ascii_serialization();
        Ok(Self {
            authorization_endpoint: Url::parse(&format!("{origin}/oauth/authorize"))
                .map_err(|e| Error::InvalidConfiguration(format!("bad server URL: {e}")))?,
            token_endpoint: Url::parse(&format!("{origin}/oauth/token"))
                .map_err(|e| Error::InvalidConfiguration(format!("bad server URL: {e}")))?,
            registration_endpoint: None,
        })
    }
}

/// Determine the authorization and token endpoints for `server_url`.
///
/// Walks the protected-resource metadata chain: an unauthenticated probe of
/// the server, the `resource_metadata` URL from its `WWW-Authenticate`
/// challenge, then the advertised authorization server's
/// `.well-known/oauth-authorization-server` document. Discovery never fails
/// the connection on its own; any missing link degrades to the
/// `<origin>/oauth/*` fallback.
pub async fn discover_endpoints(
    http: &reqwest::Client,
    server_url: &Url,
    headers: &HeaderMap,
) -> Result<OAuthEndpoints> {
    match try_discover(http, server_url, headers).await {
        Ok(endpoints) => Ok(endpoints),
        Err(e) => {
            debug!("endpoint discovery failed ({e}), using {}/oauth/* fallback", server_url.origin().ascii_serialization());
            OAuthEndpoints::fallback(server_url)
        }
    }
}

async fn try_discover(
    http: &reqwest::Client,
    server_url: &Url,
    headers: &HeaderMap,
) -> Result<OAuthEndpoints> {
    let response = http
        .get(server_url.clone())
        .headers(headers.clone())
        .header(ACCEPT, "application/json")
        .send()
        .await?;

    let auth_server = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Transport("401 without WWW-Authenticate".into()))?;
        let metadata_url = extract_resource_metadata(challenge)
            .ok_or_else(|| Error::Transport("challenge carries no resource_metadata".into()))?;

        let metadata: serde_json::Value = http.get(metadata_url).send().await?.json().await?;
        metadata
            .get("authorization_servers")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Transport("resource metadata lists no authorization server".into()))?
    } else {
        // No challenge to follow; treat the server origin as its own issuer.
        server_url.origin().ascii_serialization()
    };

    fetch_authorization_server_metadata(http, &auth_server).await
}

/// Pull the `resource_metadata="…"` URL out of a `Bearer` challenge.
pub fn extract_resource_metadata(www_authenticate: &str) -> Option<String> {
    let re = Regex::new(r#"resource_metadata="([^"]+)""#).ok()?;
    re.captures(www_authenticate)
        .map(|c| c[1].to_string())
}

/// Fetch RFC 8414 authorization-server metadata for an issuer.
pub async fn fetch_authorization_server_metadata(
    http: &reqwest::Client,
    issuer: &str,
) -> Result<OAuthEndpoints> {
    let metadata_url = if issuer.ends_with('/') {
        format!("{issuer}.well-known/oauth-authorization-server")
    } else {
        format!("{issuer}/.well-known/oauth-authorization-server")
    };

    let response = http.get(&metadata_url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "authorization server metadata request failed with status {}",
            response.status()
        )));
    }

    let metadata: serde_json::Value = response.json().await?;
    let endpoint = |key: &str| -> Result<Url> {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| Url::parse(s).ok())
            .ok_or_else(|| Error::Transport(format!("metadata is missing {key}")))
    };

    Ok(OAuthEndpoints {
        authorization_endpoint: endpoint("authorization_endpoint")?,
        token_endpoint: endpoint("token_endpoint")?,
        registration_endpoint: metadata
            .get("registration_endpoint")
            .and_then(|v| v.as_str())
            .and_then(|s| Url::parse(s).ok()),
    })
}
