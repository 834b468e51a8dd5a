use std::sync::Arc;

use tracing::debug;

use crate::{
    args::Config,
    auth::{AuthProvider, ClassicOAuthProvider, PkceOAuthProvider},
    callback::DEFAULT_CALLBACK_PATH,
    coordinator::{self, Coordination},
    discovery,
    error::Result,
    http::build_http_client,
    selector::TransportSelector,
    store::{default_callback_port, server_fingerprint, names, CredentialStore},
    transport::TransportStream,
};

/// An authorized connection to the remote, plus the coordination state the
/// caller must clean up on exit.
pub struct Session {
    pub remote: Box<dyn TransportStream>,
    pub coordination: Coordination,
}

/// Path of the fingerprint's debug log, for wiring into logging init.
pub fn debug_log_path(config: &Config) -> Result<Option<std::path::PathBuf>> {
    if !config.debug {
        return Ok(None);
    }
    let store = CredentialStore::new()?;
    let fingerprint = server_fingerprint(config.server_url.as_str());
    Ok(Some(store.path(&fingerprint, names::DEBUG_LOG)))
}

/// Wire everything up to an authorized remote connection: coordinate with
/// sibling processes, discover OAuth endpoints, pick the flow, and connect
/// with transport fallback.
pub async fn establish(config: &Config) -> Result<Session> {
    let store = CredentialStore::new()?;
    let fingerprint = server_fingerprint(config.server_url.as_str());
    debug!("remote fingerprint {fingerprint}");

    let preferred_port = config
        .callback_port
        .unwrap_or_else(|| default_callback_port(&fingerprint));
    let coordination = coordinator::acquire(
        &store,
        &fingerprint,
        preferred_port,
        DEFAULT_CALLBACK_PATH,
        config.auth_timeout,
    )
    .await?;

    let http = build_http_client(config.enable_proxy)?;
    let endpoints = discovery::discover_endpoints(&http, &config.server_url, &config.headers).await?;
    debug!(
        "authorization endpoint {}, token endpoint {}",
        endpoints.authorization_endpoint, endpoints.token_endpoint
    );

    let redirect_uri = format!(
        "http://{}:{}{}",
        config.host,
        coordination.server.port(),
        DEFAULT_CALLBACK_PATH
    );

    let provider: Arc<dyn AuthProvider> = match &config.static_client_info {
        Some(info) => Arc::new(ClassicOAuthProvider::new(
            store.clone(),
            fingerprint.clone(),
            info.clone(),
            endpoints,
            redirect_uri,
            config.resource.clone(),
            http.clone(),
            coordination.server.clone(),
            coordination.skip_browser_auth,
        )),
        None => {
            let scope = config
                .static_client_metadata
                .as_ref()
                .and_then(|m| m.get("scope"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Arc::new(PkceOAuthProvider::new(
                store.clone(),
                fingerprint.clone(),
                endpoints,
                redirect_uri,
                config.resource.clone(),
                scope,
                config.static_client_metadata.clone(),
                http.clone(),
                coordination.server.clone(),
                coordination.skip_browser_auth,
            ))
        }
    };

    let selector = TransportSelector::new(
        config.server_url.clone(),
        config.headers.clone(),
        config.transport,
        provider,
        http,
        build_http_client(config.enable_proxy)?,
        coordination.skip_browser_auth,
    );

    match selector.connect().await {
        Ok(remote) => Ok(Session {
            remote,
            coordination,
        }),
        Err(e) => {
            // Best-effort cleanup before surfacing the fatal error.
            coordination.cleanup();
            Err(e)
        }
    }
}
