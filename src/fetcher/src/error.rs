use thiserror::Error;

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),

    #[error("manifest time regressed: last verified {last}, got {got}")]
    ManifestTimeRegressed { last: u64, got: u64 },

    #[error("hash mismatch for image {timestamp}: expected {expected}, got {actual}")]
    InvalidHash {
        timestamp: u64,
        expected: String,
        actual: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
