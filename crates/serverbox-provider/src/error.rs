use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("provider API error: {0}")]
    ApiError(String),

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("DAYTONA_API_KEY is not configured")]
    MissingApiKey,
}
