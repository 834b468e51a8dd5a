//! OAuth 2.0 authorization brokering for the proxy.
//!
//! Two interchangeable flows sit behind [`AuthProvider`]:
//!
//! - the **classical** authorization-code grant ([`classic`]) for
//!   pre-registered confidential clients (`client_id` + optional
//!   `client_secret`, no PKCE), and
//! - the **PKCE** grant ([`pkce`]), which delegates challenge, verifier and
//!   CSRF state handling to the `oauth2` crate and registers the client
//!   dynamically ([`registration`]) when none is stored.
//!
//! Both persist their artifacts through the credential store so sibling
//! processes can pick tokens up from disk, and both run the interactive leg
//! through a [`CallbackServer`](crate::callback::CallbackServer) owned by
//! the caller.

mod classic;
mod pkce;
mod registration;

pub use classic::ClassicOAuthProvider;
pub use pkce::PkceOAuthProvider;
pub use registration::{register_client, RegistrationMetadata};

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::{
    error::{Error, Result},
    store::{names, CredentialStore, TokenBundle},
};

/// Which persisted credential artifacts to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    All,
    Client,
    Tokens,
    Verifier,
}

/// The seam between the connection driver and a concrete OAuth flow.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The token bundle currently on disk, if any. Never refreshes.
    fn tokens(&self) -> Result<Option<TokenBundle>>;

    /// An access token that is good to send: returns the stored one while it
    /// is current, refreshes when possible, and otherwise runs the full
    /// interactive authorization.
    async fn ensure_access_token(&self) -> Result<String>;

    /// Run the interactive authorization-code flow to completion and persist
    /// the resulting bundle.
    async fn authorize(&self) -> Result<TokenBundle>;

    /// Exchange an authorization code delivered out of band.
    async fn finish_auth(&self, code: &str) -> Result<TokenBundle>;

    /// Delete persisted credentials for the given scope.
    fn invalidate_credentials(&self, scope: CredentialScope) -> Result<()>;
}

pub(crate) fn invalidate(
    store: &CredentialStore,
    fingerprint: &str,
    scope: CredentialScope,
) -> Result<()> {
    debug!("invalidating credentials: {scope:?}");
    match scope {
        CredentialScope::All => {
            store.delete(fingerprint, names::TOKENS)?;
            store.delete(fingerprint, names::CLIENT_INFO)?;
            store.delete(fingerprint, names::CODE_VERIFIER)?;
        }
        CredentialScope::Client => store.delete(fingerprint, names::CLIENT_INFO)?,
        CredentialScope::Tokens => store.delete(fingerprint, names::TOKENS)?,
        CredentialScope::Verifier => store.delete(fingerprint, names::CODE_VERIFIER)?,
    }
    Ok(())
}

/// Secondary-instance path: tokens are expected to appear on disk once the
/// leader finishes. Waits roughly a second before the first read so a leader
/// that just reported completion has flushed its write, then keeps polling
/// for a bounded while.
pub(crate) async fn wait_for_tokens_on_disk(
    store: &CredentialStore,
    fingerprint: &str,
) -> Result<TokenBundle> {
    tokio::time::sleep(Duration::from_secs(1)).await;
    for _ in 0..30 {
        if let Some(tokens) = store.get_json::<TokenBundle>(fingerprint, names::TOKENS)? {
            return Ok(tokens);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(Error::AuthorizationFailed(
        "timed out waiting for the authorizing process to write tokens".into(),
    ))
}

/// Merge a token response with the previous bundle: servers may omit
/// `refresh_token` on refresh, in which case the old one stays valid.
pub(crate) fn preserve_refresh_token(
    mut fresh: TokenBundle,
    previous: Option<&TokenBundle>,
) -> TokenBundle {
    if fresh.refresh_token.is_none() {
        fresh.refresh_token = previous.and_then(|p| p.refresh_token.clone());
    }
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_invalidate_scopes() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::at(tmp.path().to_path_buf());
        let fp = "cafe";
        for name in [names::TOKENS, names::CLIENT_INFO, names::CODE_VERIFIER] {
            store.put(fp, name, b"{}").unwrap();
        }

        invalidate(&store, fp, CredentialScope::Verifier).unwrap();
        assert!(store.get(fp, names::CODE_VERIFIER).unwrap().is_none());
        assert!(store.get(fp, names::TOKENS).unwrap().is_some());

        invalidate(&store, fp, CredentialScope::All).unwrap();
        assert!(store.get(fp, names::TOKENS).unwrap().is_none());
        assert!(store.get(fp, names::CLIENT_INFO).unwrap().is_none());
    }

    #[test]
    fn test_preserve_refresh_token() {
        let old = TokenBundle {
            access_token: "old".into(),
            token_type: "Bearer".into(),
            expires_in: Some(0.0),
            refresh_token: Some("keepme".into()),
            scope: None,
        };
        let fresh = TokenBundle {
            access_token: "new".into(),
            token_type: "Bearer".into(),
            expires_in: Some(3600.0),
            refresh_token: None,
            scope: None,
        };

        let merged = preserve_refresh_token(fresh.clone(), Some(&old));
        assert_eq!(merged.refresh_token.as_deref(), Some("keepme"));

        let mut explicit = fresh;
        explicit.refresh_token = Some("rotated".into());
        let merged = preserve_refresh_token(explicit, Some(&old));
        assert_eq!(merged.refresh_token.as_deref(), Some("rotated"));
    }
}
