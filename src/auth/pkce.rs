use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use oauth2::{
    basic::{
        BasicClient, BasicErrorResponse, BasicRevocationErrorResponse,
        BasicTokenIntrospectionResponse, BasicTokenResponse, BasicTokenType,
    },
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope,
    StandardRevocableToken, TokenResponse, TokenUrl,
};
use tracing::{info, warn};

use crate::{
    callback::CallbackServer,
    discovery::OAuthEndpoints,
    error::{Error, Result},
    store::{names, ClientRegistration, CredentialStore, TokenBundle},
};

use super::{
    invalidate, preserve_refresh_token, register_client, wait_for_tokens_on_disk, AuthProvider,
    CredentialScope, RegistrationMetadata,
};

type ConfiguredClient = oauth2::Client<
    BasicErrorResponse,
    BasicTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// PKCE authorization-code flow. Challenge, verifier and CSRF state come
/// from the `oauth2` crate; the verifier and the registered client are
/// persisted through the credential store so a restarted process (or the
/// transport's `finish_auth` path) can complete the exchange.
pub struct PkceOAuthProvider {
    store: CredentialStore,
    fingerprint: String,
    endpoints: OAuthEndpoints,
    redirect_uri: String,
    resource: Option<String>,
    scope: Option<String>,
    metadata_overrides: Option<serde_json::Value>,
    http: reqwest::Client,
    callback: Arc<CallbackServer>,
    skip_browser_auth: bool,
    csrf: Mutex<Option<CsrfToken>>,
}

impl PkceOAuthProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: CredentialStore,
        fingerprint: String,
        endpoints: OAuthEndpoints,
        redirect_uri: String,
        resource: Option<String>,
        scope: Option<String>,
        metadata_overrides: Option<serde_json::Value>,
        http: reqwest::Client,
        callback: Arc<CallbackServer>,
        skip_browser_auth: bool,
    ) -> Self {
        Self {
            store,
            fingerprint,
            endpoints,
            redirect_uri,
            resource,
            scope,
            metadata_overrides,
            http,
            callback,
            skip_browser_auth,
            csrf: Mutex::new(None),
        }
    }

    /// The stored client registration, registering dynamically on first use.
    async fn client_registration(&self) -> Result<ClientRegistration> {
        if let Some(registration) = self
            .store
            .get_json::<ClientRegistration>(&self.fingerprint, names::CLIENT_INFO)?
        {
            return Ok(registration);
        }

        let endpoint = self.endpoints.registration_endpoint.as_ref().ok_or_else(|| {
            Error::InvalidConfiguration(
                "authorization server advertises no registration endpoint; \
                 supply --static-oauth-client-info"
                    .into(),
            )
        })?;

        let mut metadata = RegistrationMetadata::for_redirect(&self.redirect_uri)
            .with_scope(self.scope.clone());
        if let Some(overrides) = &self.metadata_overrides {
            metadata = metadata.overlaid(overrides);
        }

        let registration = register_client(&self.http, endpoint, &metadata).await?;
        self.store
            .put_json(&self.fingerprint, names::CLIENT_INFO, &registration)?;
        Ok(registration)
    }

    fn oauth_client(&self, registration: &ClientRegistration) -> Result<ConfiguredClient> {
        let mut client = BasicClient::new(ClientId::new(registration.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(self.endpoints.authorization_endpoint.to_string())
                    .map_err(|e| Error::InvalidConfiguration(format!("invalid auth URL: {e}")))?,
            )
            .set_token_uri(
                TokenUrl::new(self.endpoints.token_endpoint.to_string())
                    .map_err(|e| Error::InvalidConfiguration(format!("invalid token URL: {e}")))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_uri.clone()).map_err(|e| {
                    Error::InvalidConfiguration(format!("invalid redirect URL: {e}"))
                })?,
            );
        if let Some(secret) = registration.client_secret.as_ref() {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }
        Ok(client)
    }

    fn to_bundle(token: &BasicTokenResponse) -> TokenBundle {
        TokenBundle {
            access_token: token.access_token().secret().clone(),
            token_type: match token.token_type() {
                BasicTokenType::Bearer => "Bearer".to_string(),
                other => format!("{other:?}"),
            },
            expires_in: token.expires_in().map(|d| d.as_secs() as f64),
            refresh_token: token.refresh_token().map(|t| t.secret().clone()),
            scope: token
                .scopes()
                .map(|s| s.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(" ")),
        }
    }

    /// Exchange a code using the persisted verifier, which is consumed by
    /// the exchange and deleted afterwards.
    pub async fn exchange(&self, code: &str) -> Result<TokenBundle> {
        let registration = self.client_registration().await?;
        let client = self.oauth_client(&registration)?;

        let verifier = self
            .store
            .get_text(&self.fingerprint, names::CODE_VERIFIER)?
            .ok_or_else(|| {
                Error::AuthorizationFailed("no code verifier on disk for this exchange".into())
            })?;

        let mut request = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier.trim().to_string()));
        if let Some(resource) = &self.resource {
            request = request.add_extra_param("resource", resource);
        }

        let token = request
            .request_async(&self.http)
            .await
            .map_err(|e| Error::AuthorizationFailed(format!("token exchange failed: {e}")))?;

        let bundle = Self::to_bundle(&token);
        self.store
            .put_json(&self.fingerprint, names::TOKENS, &bundle)?;
        self.store.delete(&self.fingerprint, names::CODE_VERIFIER)?;
        Ok(bundle)
    }

    /// Refresh the stored bundle, carrying the previous refresh token over
    /// when the endpoint omits one.
    pub async fn refresh(&self) -> Result<TokenBundle> {
        let previous = self.tokens()?.ok_or(Error::NoRefreshToken)?;
        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(Error::NoRefreshToken)?;

        let registration = self.client_registration().await?;
        let client = self.oauth_client(&registration)?;

        let refresh_token = RefreshToken::new(refresh_token);
        let mut request = client.exchange_refresh_token(&refresh_token);
        if let Some(resource) = &self.resource {
            request = request.add_extra_param("resource", resource);
        }

        let token = request
            .request_async(&self.http)
            .await
            .map_err(|e| Error::TokenRefreshFailed(e.to_string()))?;

        let merged = preserve_refresh_token(Self::to_bundle(&token), Some(&previous));
        self.store
            .put_json(&self.fingerprint, names::TOKENS, &merged)?;
        Ok(merged)
    }

    async fn run_interactive(&self) -> Result<TokenBundle> {
        let registration = self.client_registration().await?;
        let client = self.oauth_client(&registration)?;

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        self.store.put(
            &self.fingerprint,
            names::CODE_VERIFIER,
            verifier.secret().as_bytes(),
        )?;

        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge);
        if let Some(resource) = &self.resource {
            request = request.add_extra_param("resource", resource);
        }
        if let Some(scope) = &self.scope {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let (url, csrf) = request.url();
        *self.csrf.lock().unwrap_or_else(|e| e.into_inner()) = Some(csrf);

        info!("opening browser for authorization: {url}");
        if let Err(e) = webbrowser::open(url.as_str()) {
            warn!("could not open a browser ({e}); visit the URL above manually");
        }

        let delivered = self.callback.await_code().await;
        let expected = self
            .csrf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::AuthorizationFailed("missing CSRF state".into()))?;
        if delivered.state.as_deref() != Some(expected.secret().as_str()) {
            return Err(Error::AuthorizationFailed(
                "state mismatch on callback".into(),
            ));
        }

        let bundle = self.exchange(&delivered.code).await?;
        // Tokens are on disk; only now may siblings observe completion.
        self.callback.complete();
        Ok(bundle)
    }
}

#[async_trait]
impl AuthProvider for PkceOAuthProvider {
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
