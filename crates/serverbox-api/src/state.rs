use std::sync::Arc;

use serverbox_lifecycle::{LifecycleManager, ResumeCoordinator};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub resume: Arc<ResumeCoordinator>,
    pub admin_api_key: Arc<String>,
    /// `None` means proxy-route auth is disabled.
    pub proxy_api_key: Arc<Option<String>>,
    /// This listener's externally-visible base URL, used to build `proxyUrl`
    /// on serialized records.
    pub proxy_base_url: Arc<String>,
    pub auto_resume: bool,
    pub resume_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub http: reqwest::Client,
}
