use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("checkpoint version {version} is newer than this engine supports ({current})")]
    UnsupportedVersion { version: u32, current: u32 },

    #[error("checkpoint uses features this engine does not support: {}", features.join(", "))]
    UnsupportedFeatures { features: Vec<String> },

    #[error("malformed checkpoint: {0}")]
    Malformed(String),

    #[error("checkpoint failed integrity check: {0}")]
    Integrity(#[from] strata_core::CoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 GetObject error: {0}")]
    GetObject(String),

    #[error("S3 PutObject error: {0}")]
    PutObject(String),
}
