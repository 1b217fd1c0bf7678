use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no provider credentials supplied and no fallback API key is configured")]
    MissingAuth,

    #[error("invalid provider credential entry: {0}")]
    InvalidConfig(String),
}
