use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::{
    error::{Error, Result},
    store::ClientRegistration,
};

/// Client metadata posted to an RFC 7591 dynamic-registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationMetadata {
    pub redirect_uris: Vec<String>,
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

impl RegistrationMetadata {
    /// Defaults for this proxy: a public client doing the code grant with
    /// refresh, authenticating nowhere but the loopback redirect.
    pub fn for_redirect(redirect_uri: &str) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.to_string()],
            client_name: "MCP CLI Proxy".to_string(),
            client_uri: None,
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            scope: None,
            software_id: Some(env!("CARGO_PKG_NAME").to_string()),
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Overlay caller-supplied metadata (the `--static-oauth-client-metadata`
    /// flag) onto the defaults. Only recognized fields participate.
    pub fn overlaid(mut self, overrides: &serde_json::Value) -> Self {
        if let Some(name) = overrides.get("client_name").and_then(|v| v.as_str()) {
            self.client_name = name.to_string();
        }
        if let Some(uri) = overrides.get("client_uri").and_then(|v| v.as_str()) {
            self.client_uri = Some(uri.to_string());
        }
        if let Some(scope) = overrides.get("scope").and_then(|v| v.as_str()) {
            self.scope = Some(scope.to_string());
        }
        if let Some(method) = overrides
            .get("token_endpoint_auth_method")
            .and_then(|v| v.as_str())
        {
            self.token_endpoint_auth_method = method.to_string();
        }
        if let Some(grants) = overrides.get("grant_types").and_then(|v| v.as_array()) {
            self.grant_types = grants
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        self
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    client_secret: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    grant_types: Vec<String>,
    #[serde(default)]
    response_types: Vec<String>,
    client_name: Option<String>,
    client_uri: Option<String>,
    software_id: Option<String>,
    software_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Register a client with the authorization server and return the issued
/// registration.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &Url,
    metadata: &RegistrationMetadata,
) -> Result<ClientRegistration> {
    info!("registering OAuth client at {registration_endpoint}");
    let response = http
        .post(registration_endpoint.clone())
        .json(metadata)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        // Registration endpoints describe failures in a small JSON envelope.
        return match response.json::<RegistrationErrorBody>().await {
            Ok(body) => Err(Error::AuthorizationFailed(format!(
                "client registration failed: {} - {}",
                body.error,
                body.error_description.unwrap_or_default()
            ))),
            Err(_) => Err(Error::AuthorizationFailed(format!(
                "client registration failed with status {status}"
            ))),
        };
    }

    let issued: RegistrationResponse = response.json().await?;
    Ok(ClientRegistration {
        client_id: issued.client_id,
        client_secret: issued.client_secret,
        redirect_uris: issued.redirect_uris,
        token_endpoint_auth_method: issued.token_endpoint_auth_method,
        grant_types: issued.grant_types,
        response_types: issued.response_types,
        client_name: issued.client_name,
        client_uri: issued.client_uri,
        software_id: issued.software_id,
        software_version: issued.software_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_metadata() {
        let metadata = RegistrationMetadata::for_redirect("http://127.0.0.1:4711/oauth/callback");
        assert_eq!(
            metadata.redirect_uris,
            vec!["http://127.0.0.1:4711/oauth/callback"]
        );
        assert_eq!(metadata.token_endpoint_auth_method, "none");
        assert!(metadata
            .grant_types
            .contains(&"refresh_token".to_string()));
        assert_eq!(metadata.software_id.as_deref(), Some("mcp-remote"));
    }

    #[test]
    fn test_overlay_replaces_recognized_fields() {
        let metadata = RegistrationMetadata::for_redirect("http://127.0.0.1:1/cb").overlaid(
            &json!({
                "client_name": "Custom",
                "scope": "read write",
                "grant_types": ["authorization_code"],
                "unknown_field": true
            }),
        );
        assert_eq!(metadata.client_name, "Custom");
        assert_eq!(metadata.scope.as_deref(), Some("read write"));
        assert_eq!(metadata.grant_types, vec!["authorization_code"]);
    }

    #[test]
    fn test_metadata_serialization_skips_absent() {
        let metadata = RegistrationMetadata::for_redirect("http://127.0.0.1:1/cb");
        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("client_uri").is_none());
        assert!(json.get("scope").is_none());
        assert_eq!(json["response_types"], json!(["code"]));
    }
}
