use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid certificate chain: {0}")]
    InvalidCertChain(String),

    #[error("invalid signature over manifest bytes")]
    InvalidSignature,

    #[error("no image eligible for this node")]
    NoValidImage,

    #[error("key error: {0}")]
    Key(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
