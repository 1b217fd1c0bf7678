use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance is not running: {0}")]
    InstanceNotRunning(String),

    #[error("failed to create instance: {0}")]
    CreateFailed(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("auth error: {0}")]
    Auth(#[from] serverbox_auth::AuthError),

    #[error(transparent)]
    Provider(#[from] serverbox_provider::ProviderError),

    #[error(transparent)]
    Store(#[from] serverbox_store::StoreError),
}
