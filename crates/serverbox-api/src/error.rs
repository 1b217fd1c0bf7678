use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use serverbox_auth::AuthError;
use serverbox_lifecycle::LifecycleError;
use serverbox_provider::ProviderError;

/// The JSON error envelope and HTTP status this crate ever produces. Every
/// failure path — lifecycle, proxy, or request-parsing — funnels through
/// here so the wire contract stays uniform.
pub struct ApiError {
    pub status: StatusCode,
    pub code: Option<&'static str>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_CONFIG", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNAUTHORIZED,
            code: None,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            code: Some("INSTANCE_NOT_FOUND"),
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>, details: impl Into<String>) -> Response {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": msg.into(), "details": details.into() })),
        )
            .into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.code {
            Some(code) => json!({ "error": self.message, "code": code }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match &e {
            LifecycleError::InstanceNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND", e.to_string())
            }
            LifecycleError::InstanceNotRunning(_) => {
                Self::new(StatusCode::CONFLICT, "INSTANCE_NOT_RUNNING", e.to_string())
            }
            LifecycleError::CreateFailed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CREATE_FAILED",
                e.to_string(),
            ),
            LifecycleError::UnsupportedOperation(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNSUPPORTED_OPERATION",
                e.to_string(),
            ),
            LifecycleError::Auth(AuthError::MissingAuth) => {
                Self::new(StatusCode::BAD_REQUEST, "MISSING_AUTH", e.to_string())
            }
            LifecycleError::Auth(AuthError::InvalidConfig(_)) => {
                Self::bad_request(e.to_string())
            }
            LifecycleError::Provider(ProviderError::SandboxNotFound(_)) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "SANDBOX_NOT_FOUND",
                e.to_string(),
            ),
            LifecycleError::Provider(ProviderError::ApiError(_)) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DAYTONA_API_ERROR",
                e.to_string(),
            ),
            LifecycleError::Provider(ProviderError::HealthCheckFailed(_)) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "HEALTH_CHECK_FAILED",
                e.to_string(),
            ),
            LifecycleError::Provider(ProviderError::BootstrapFailed(_)) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BOOTSTRAP_FAILED",
                e.to_string(),
            ),
            LifecycleError::Provider(ProviderError::MissingApiKey) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "MISSING_DAYTONA_API_KEY",
                e.to_string(),
            ),
            LifecycleError::Store(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                e.to_string(),
            ),
        }
    }
}
