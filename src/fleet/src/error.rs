use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}
