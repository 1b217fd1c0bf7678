use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapter::{ExecOptions, ProviderAdapter, Sandbox};
use crate::error::ProviderError;

const SESSION_NAME: &str = "serverbox-upstream";

/// Everything the bootstrap driver needs to install and launch (or just
/// relaunch) the upstream server inside a sandbox.
pub struct BootstrapConfig {
    pub username: String,
    pub password: String,
    pub provider_env: HashMap<String, String>,
    pub auth_record: Option<HashMap<String, String>>,
    pub upstream_config: Option<String>,
    pub upstream_port: u16,
    /// When `true`, install the upstream binary first. `false` on resume,
    /// where the binary is assumed already present.
    pub install_upstream: bool,
}

/// Installs and launches the upstream HTTP server inside a freshly
/// provisioned (or resumed) sandbox.
#[async_trait]
pub trait BootstrapDriver: Send + Sync + 'static {
    async fn bootstrap(&self, sandbox: &Sandbox, cfg: &BootstrapConfig) -> Result<(), ProviderError>;
}

/// Drives bootstrap purely through [`ProviderAdapter::exec`] and
/// [`ProviderAdapter::upload_file`] — no provider-specific API beyond the
/// adapter surface.
pub struct DefaultBootstrapDriver {
    adapter: Arc<dyn ProviderAdapter>,
}

impl DefaultBootstrapDriver {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self { adapter }
    }

    async fn run(&self, sandbox: &Sandbox, cmd: &str) -> Result<(), ProviderError> {
        let out = self
            .adapter
            .exec(sandbox, cmd, &ExecOptions::default())
            .await?;
        if out.exit_code != 0 {
            return Err(ProviderError::BootstrapFailed(format!(
                "command '{cmd}' exited {}: {}",
                out.exit_code, out.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BootstrapDriver for DefaultBootstrapDriver {
    async fn bootstrap(&self, sandbox: &Sandbox, cfg: &BootstrapConfig) -> Result<(), ProviderError> {
        if cfg.install_upstream {
            info!(sandbox_id = %sandbox.id, "bootstrap: installing upstream server");
            self.run(sandbox, "curl -fsSL https://get.opencode.ai | sh")
                .await?;
        } else {
            debug!(sandbox_id = %sandbox.id, "bootstrap: skipping install, resuming existing install");
        }

        if let Some(record) = &cfg.auth_record {
            let json = serde_json::to_vec(record)
                .map_err(|e| ProviderError::BootstrapFailed(e.to_string()))?;
            self.adapter
                .upload_file(sandbox, "/root/.config/opencode/auth.json", json)
                .await?;
        }
        if let Some(config) = &cfg.upstream_config {
            self.adapter
                .upload_file(
                    sandbox,
                    "/root/.config/opencode/config.json",
                    config.clone().into_bytes(),
                )
                .await?;
        }

        // Tear down any previous session and start a fresh long-running one —
        // idempotent whether or not a session from a prior bootstrap exists.
        self.run(sandbox, &format!("tmux kill-session -t {SESSION_NAME} 2>/dev/null; true"))
            .await?;

        let mut env_prefix = String::new();
        for (k, v) in &cfg.provider_env {
            env_prefix.push_str(&format!("{k}={v} "));
        }

        let launch = format!(
            "tmux new-session -d -s {SESSION_NAME} '{env_prefix}OPENCODE_USERNAME={} OPENCODE_PASSWORD={} opencode serve --port {}'",
            cfg.username, cfg.password, cfg.upstream_port
        );
        self.run(sandbox, &launch).await?;

        info!(sandbox_id = %sandbox.id, "bootstrap: upstream server launched");
        Ok(())
    }
}
