use std::path::PathBuf;

use md5::{Digest, Md5};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Environment variable overriding the config directory root.
pub const CONFIG_DIR_ENV: &str = "MCP_REMOTE_CONFIG_DIR";

/// 128-bit MD5 digest of the remote server URL, lowercase hex. The single
/// key under which all persisted state for that remote lives.
pub fn server_fingerprint(server_url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(server_url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Default callback port seeded from the fingerprint so that distinct
/// remotes get distinct (but stable) loopback ports.
pub fn default_callback_port(fingerprint: &str) -> u16 {
    let hi16 = fingerprint
        .get(..4)
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .unwrap_or(0);
    (3335 + hi16 % 45816) as u16
}

/// Current token bundle for a remote. `expires_in` is whatever the token
/// endpoint last reported; zero or negative means expired. Malformed values
/// are tolerated on read: the bundle remains usable until the server
/// rejects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBundle {
    pub access_token: String,
    pub token_type: String,
    #[serde(
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenBundle {
    /// Usable without refresh: `expires_in` absent or still positive.
    pub fn is_current(&self) -> bool {
        self.expires_in.map(|s| s > 0.0).unwrap_or(true)
    }
}

fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(other) => {
            warn!("ignoring non-numeric expires_in in stored tokens: {other}");
            None
        }
    })
}

/// OAuth client registration, either supplied statically at startup or
/// produced by dynamic registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// Leader-election lockfile record. `timestamp` is milliseconds since the
/// Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub pid: u32,
    pub port: u16,
    pub timestamp: u64,
}

/// Well-known store entry names; files on disk are `<fingerprint>_<name>`.
pub mod names {
    pub const TOKENS: &str = "tokens.json";
    pub const CLIENT_INFO: &str = "client_info.json";
    pub const CODE_VERIFIER: &str = "code_verifier.txt";
    pub const LOCK: &str = "lock.json";
    pub const DEBUG_LOG: &str = "debug.log";
}

/// Thin wrapper over the user config directory. Absent files surface as
/// `None`, never as errors. Writers create the directory on demand and do
/// not lock: the coordinator's lockfile is the cross-process serialization
/// discipline.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Store rooted at `${MCP_REMOTE_CONFIG_DIR or $HOME/.mcp-auth}/mcp-remote-<version>/`.
    pub fn new() -> Result<Self> {
        let root = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| {
                    Error::InvalidConfiguration("cannot determine home directory".into())
                })?
                .join(".mcp-auth"),
        };
        Ok(Self::at(root))
    }

    /// Store rooted at an explicit directory (tests).
    pub fn at(root: PathBuf) -> Self {
        Self {
            dir: root.join(format!("mcp-remote-{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn path(&self, fingerprint: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}_{name}"))
    }

    pub fn get(&self, fingerprint: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(fingerprint, name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, fingerprint: &str, name: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(fingerprint, name), bytes)?;
        Ok(())
    }

    pub fn delete(&self, fingerprint: &str, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path(fingerprint, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a JSON value. A file that fails to parse is treated as absent
    /// (the flow re-creates it), with a warning.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        fingerprint: &str,
        name: &str,
    ) -> Result<Option<T>> {
        let Some(bytes) = self.get(fingerprint, name)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("discarding unparseable {name} for {fingerprint}: {e}");
                Ok(None)
            }
        }
    }

    /// Write a JSON value with two-space indentation so the files stay
    /// human-inspectable.
    pub fn put_json<T: Serialize>(&self, fingerprint: &str, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.put(fingerprint, name, json.as_bytes())
    }

    pub fn get_text(&self, fingerprint: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .get(fingerprint, name)?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}
