use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    TransportDisconnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid message format: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token exchange failed with HTTP {status}: {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures that should trigger a transport-family fallback
    /// under a `*-first` strategy.
    pub fn is_transport_fallback(&self) -> bool {
        const MARKERS: [&str; 4] = ["404", "405", "Not Found", "Method Not Allowed"];
        let message = self.to_string();
        MARKERS.iter().any(|m| message.contains(m))
    }

    /// Attach a CA-bundle hint to TLS failures caused by private roots.
    pub fn enrich(self) -> Self {
        let message = self.to_string();
        if message.contains("self-signed certificate in certificate chain") {
            Error::Transport(format!(
                "{message} (the server presented a certificate signed by a private CA; \
                 point SSL_CERT_FILE at a bundle that includes it)"
            ))
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_markers() {
        assert!(Error::Transport("HTTP/1.1 405 Method Not Allowed".into())
            .is_transport_fallback());
        assert!(Error::Transport("status 404".into()).is_transport_fallback());
        assert!(!Error::Transport("connection refused".into()).is_transport_fallback());
        assert!(!Error::NoRefreshToken.is_transport_fallback());
    }

    #[test]
    fn test_self_signed_hint() {
        let err = Error::Transport("self-signed certificate in certificate chain".into());
        assert!(err.enrich().to_string().contains("SSL_CERT_FILE"));

        let err = Error::Transport("connection reset".into());
        assert!(!err.enrich().to_string().contains("SSL_CERT_FILE"));
    }
}
