use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use serverbox_domain::{LifecycleIntervals, ResourceSpec};

use crate::error::ProviderError;

/// Normalized sandbox lifecycle state, collapsed from whatever vocabulary the
/// backing provider's API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopped,
    Archived,
    Destroyed,
    Error,
}

impl SandboxState {
    /// `running|started → running`, `stopped → stopped`, `archived → archived`,
    /// `destroyed|deleted → destroyed`, `provisioning|creating → provisioning`,
    /// otherwise `error`.
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" | "started" => SandboxState::Running,
            "stopped" => SandboxState::Stopped,
            "archived" => SandboxState::Archived,
            "destroyed" | "deleted" => SandboxState::Destroyed,
            "provisioning" | "creating" => SandboxState::Provisioning,
            _ => SandboxState::Error,
        }
    }
}

/// Opaque provider-side sandbox handle. `raw` carries the full API response
/// for anything an adapter implementation needs beyond the normalized fields.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub state: SandboxState,
    pub raw: Value,
}

/// Everything needed to request a fresh sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub id: Option<String>,
    pub language: Option<String>,
    pub labels: HashMap<String, String>,
    pub resources: ResourceSpec,
    pub lifecycle: LifecycleIntervals,
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PreviewLink {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Uniform surface over the sandbox provider's SDK. Capability detection
/// (choosing among the provider's multiple possible method names/response
/// shapes) happens once, at adapter construction — callers see one canonical
/// method set regardless of which concrete adapter is wired in.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox, ProviderError>;

    /// By `findOne`, else `get`, else a linear scan over `list`; fails with
    /// [`ProviderError::SandboxNotFound`] if every path yields "not found".
    async fn find_sandbox(&self, id: &str) -> Result<Sandbox, ProviderError>;

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, ProviderError>;

    async fn remove_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError>;

    async fn start_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError>;

    async fn stop_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError>;

    async fn archive_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError>;

    async fn get_preview_link(
        &self,
        sandbox: &Sandbox,
        port: u16,
    ) -> Result<PreviewLink, ProviderError>;

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, ProviderError>;

    async fn upload_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<(), ProviderError>;

    async fn download_file(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<u8>, ProviderError>;
}
