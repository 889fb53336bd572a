use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdfxError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SdfxError>;
