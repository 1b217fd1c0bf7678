use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingRequired(String),

    #[error("invalid value for {var}: '{value}' ({message})")]
    InvalidValue {
        var: String,
        value: String,
        message: String,
    },
}
