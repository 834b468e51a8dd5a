use std::time::Duration;

use clap::Parser;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;
use url::Url;

use crate::{
    error::{Error, Result},
    selector::TransportStrategy,
    store::ClientRegistration,
};

const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;

/// Bridge a stdio MCP client to a remote OAuth-protected MCP server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-remote", version, about)]
pub struct Cli {
    /// Remote MCP server URL (https, unless localhost or --allow-http)
    pub server_url: String,

    /// Loopback port for the OAuth callback (default derives from the
    /// server URL)
    pub callback_port: Option<u16>,

    /// Extra header sent on every remote request, as "Name: Value".
    /// Values may reference environment variables as ${VARNAME}
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Allow plain http:// for non-localhost servers
    #[arg(long)]
    pub allow_http: bool,

    /// Remote transport strategy
    #[arg(long, default_value = "http-first")]
    pub transport: TransportStrategy,

    /// Hostname used in the OAuth redirect URI
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Client metadata for dynamic registration, as inline JSON or @file
    #[arg(long, value_name = "JSON | @FILE")]
    pub static_oauth_client_metadata: Option<String>,

    /// Pre-registered OAuth client, as inline JSON or @file. Presence
    /// selects the classical (non-PKCE) flow
    #[arg(long, value_name = "JSON | @FILE")]
    pub static_oauth_client_info: Option<String>,

    /// OAuth resource indicator forwarded to the authorization server
    #[arg(long)]
    pub resource: Option<String>,

    /// Hide tools matching this glob (repeatable)
    #[arg(long = "ignore-tool", value_name = "PATTERN")]
    pub ignore_tools: Vec<String>,

    /// Seconds to hold the /wait-for-auth long poll open
    #[arg(long, value_name = "SECONDS", default_value = "30", allow_hyphen_values = true)]
    pub auth_timeout: String,

    /// Also append a trace to <hash>_debug.log in the config directory
    #[arg(long)]
    pub debug: bool,

    /// Honor HTTP(S)_PROXY / NO_PROXY from the environment
    #[arg(long)]
    pub enable_proxy: bool,
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: Url,
    pub callback_port: Option<u16>,
    pub headers: HeaderMap,
    pub transport: TransportStrategy,
    pub host: String,
    pub static_client_metadata: Option<serde_json::Value>,
    pub static_client_info: Option<ClientRegistration>,
    pub resource: Option<String>,
    pub ignore_tools: Vec<String>,
    pub auth_timeout: Duration,
    pub debug: bool,
    pub enable_proxy: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let server_url = Url::parse(&self.server_url)
            .map_err(|e| Error::InvalidConfiguration(format!("invalid server URL: {e}")))?;

        let host_is_loopback = matches!(server_url.host_str(), Some("localhost" | "127.0.0.1"));
        if server_url.scheme() != "https" && !host_is_loopback && !self.allow_http {
            return Err(Error::InvalidConfiguration(format!(
                "refusing insecure scheme {}:// for a non-localhost server (pass --allow-http to override)",
                server_url.scheme()
            )));
        }

        let headers = parse_headers(&self.headers)?;

        let static_client_metadata = self
            .static_oauth_client_metadata
            .as_deref()
            .map(load_json_argument)
            .transpose()?;
        let static_client_info = self
            .static_oauth_client_info
            .as_deref()
            .map(load_json_argument)
            .transpose()?
            .map(|value| {
                serde_json::from_value::<ClientRegistration>(value).map_err(|e| {
                    Error::InvalidConfiguration(format!("invalid static client info: {e}"))
                })
            })
            .transpose()?;

        Ok(Config {
            server_url,
            callback_port: self.callback_port,
            headers,
            transport: self.transport,
            host: self.host,
            static_client_metadata,
            static_client_info,
            resource: self.resource,
            ignore_tools: self.ignore_tools,
            auth_timeout: parse_auth_timeout(&self.auth_timeout),
            debug: self.debug,
            enable_proxy: self.enable_proxy,
        })
    }
}

/// A positive integer number of seconds; anything else is rejected with a
/// warning and the default used.
fn parse_auth_timeout(raw: &str) -> Duration {
    match raw.trim().parse::<i64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => {
            warn!("invalid --auth-timeout {raw:?}; using default {DEFAULT_AUTH_TIMEOUT_SECS}s");
            Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS)
        }
    }
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let (name, value) = entry.split_once(':').ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "header {entry:?} is not of the form \"Name: Value\""
            ))
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::InvalidConfiguration(format!("bad header name in {entry:?}: {e}")))?;
        let value = expand_env(value.trim());
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::InvalidConfiguration(format!("bad header value in {entry:?}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Substitute `${VARNAME}` from the process environment. Undefined
/// variables expand to the empty string with a warning.
fn expand_env(value: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    re.replace_all(value, |caps: &regex::Captures| {
        let name = &caps[1];
        std::env::var(name).unwrap_or_else(|_| {
            warn!("environment variable {name} is not set; substituting an empty string");
            String::new()
        })
    })
    .into_owned()
}

/// Inline JSON, or `@path` to read it from a file.
fn load_json_argument(raw: &str) -> Result<serde_json::Value> {
    let text = if let Some(path) = raw.strip_prefix('@') {
        std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfiguration(format!("cannot read {path}: {e}")))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text)
        .map_err(|e| Error::InvalidConfiguration(format!("invalid JSON argument: {e}")))
}
