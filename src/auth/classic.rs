use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    callback::CallbackServer,
    discovery::OAuthEndpoints,
    error::{Error, Result},
    store::{names, ClientRegistration, CredentialStore, TokenBundle},
};

use super::{
    invalidate, preserve_refresh_token, wait_for_tokens_on_disk, AuthProvider, CredentialScope,
};

/// Classical OAuth 2.0 authorization-code flow for a pre-registered
/// confidential client. No PKCE: the loopback redirect plus the `state`
/// check are the trust boundary, and the optional `client_secret` rides on
/// the token exchange.
pub struct ClassicOAuthProvider {
    store: CredentialStore,
    fingerprint: String,
    registration: ClientRegistration,
    endpoints: OAuthEndpoints,
    redirect_uri: String,
    resource: Option<String>,
    /// Generated once per provider instance and sent unchanged.
    state: String,
    http: reqwest::Client,
    callback: Arc<CallbackServer>,
    skip_browser_auth: bool,
}

impl ClassicOAuthProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: CredentialStore,
        fingerprint: String,
        registration: ClientRegistration,
        endpoints: OAuthEndpoints,
        redirect_uri: String,
        resource: Option<String>,
        http: reqwest::Client,
        callback: Arc<CallbackServer>,
        skip_browser_auth: bool,
    ) -> Self {
        Self {
            store,
            fingerprint,
            registration,
            endpoints,
            redirect_uri,
            resource,
            state: Uuid::new_v4().to_string(),
            http,
            callback,
            skip_browser_auth,
        }
    }

    /// The URL the user's browser is sent to. Carries `response_type=code`,
    /// the client id, the loopback redirect and the per-instance `state`;
    /// `resource` when configured; never a `code_challenge`.
    pub fn authorization_url(&self) -> Url {
        let mut url = self.endpoints.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.registration.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("state", &self.state);
            if let Some(resource) = &self.resource {
                query.append_pair("resource", resource);
            }
        }
        url
    }

    /// Exchange an authorization code at the token endpoint and persist the
    /// resulting bundle.
    pub async fn exchange(&self, code: &str) -> Result<TokenBundle> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.registration.client_id.as_str()),
        ];
        if let Some(secret) = &self.registration.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(resource) = &self.resource {
            form.push(("resource", resource.as_str()));
        }

        let response = self
            .http
            .post(self.endpoints.token_endpoint.clone())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TokenExchangeFailed {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let tokens: TokenBundle = response.json().await?;
        self.store
            .put_json(&self.fingerprint, names::TOKENS, &tokens)?;
        Ok(tokens)
    }

    /// Refresh the stored bundle. Servers may rotate or omit the refresh
    /// token; an omitted one is carried over from the previous bundle.
    pub async fn refresh(&self) -> Result<TokenBundle> {
        let previous = self
            .tokens()?
            .ok_or(Error::NoRefreshToken)?;
        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(Error::NoRefreshToken)?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.registration.client_id.as_str()),
        ];
        if let Some(secret) = &self.registration.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(resource) = &self.resource {
            form.push(("resource", resource.as_str()));
        }

        let response = self
            .http
            .post(self.endpoints.token_endpoint.clone())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TokenRefreshFailed(format!(
                "HTTP {status}: {}",
                response.text().await.unwrap_or_default()
            )));
        }

        let fresh: TokenBundle = response.json().await?;
        let merged = preserve_refresh_token(fresh, Some(&previous));
        self.store
            .put_json(&self.fingerprint, names::TOKENS, &merged)?;
        Ok(merged)
    }

    async fn run_interactive(&self) -> Result<TokenBundle> {
        let url = self.authorization_url();
        info!("opening browser for authorization: {url}");
        if let Err(e) = webbrowser::open(url.as_str()) {
            warn!("could not open a browser ({e}); visit the URL above manually");
        }

        let delivered = self.callback.await_code().await;
        match delivered.state.as_deref() {
            Some(state) if state == self.state => {}
            other => {
                return Err(Error::AuthorizationFailed(format!(
                    "state mismatch on callback (got {other:?})"
                )))
            }
        }

        let tokens = self.exchange(&delivered.code).await?;
        // Tokens are on disk; only now may siblings observe completion.
        self.callback.complete();
        Ok(tokens)
    }
}

#[async_trait]
impl AuthProvider for ClassicOAuthProvider {
    fn tokens(&self) -> Result<Option<TokenBundle>> {
        self.store.get_json(&self.fingerprint, names::TOKENS)
    }

    async fn ensure_access_token(&self) -> Result<String> {
        if let Some(tokens) = self.tokens()? {
            if tokens.is_current() {
                return Ok(tokens.access_token);
            }
            // A secondary never writes tokens, so it also never refreshes.
            if tokens.refresh_token.is_some() && !self.skip_browser_auth {
                match self.refresh().await {
                    Ok(fresh) => return Ok(fresh.access_token),
                    Err(e) => warn!("token refresh failed, re-authorizing: {e}"),
                }
            }
        }
        Ok(self.authorize().await?.access_token)
    }

    async fn authorize(&self) -> Result<TokenBundle> {
        if self.skip_browser_auth {
            return wait_for_tokens_on_disk(&self.store, &self.fingerprint).await;
        }
        let result = self.run_interactive().await;
        // Every exit path stops the callback server.
        self.callback.shutdown();
        result
    }

    async fn finish_auth(&self, code: &str) -> Result<TokenBundle> {
        self.exchange(code).await
    }

    fn invalidate_credentials(&self, scope: CredentialScope) -> Result<()> {
        invalidate(&self.store, &self.fingerprint, scope)
    }
}
