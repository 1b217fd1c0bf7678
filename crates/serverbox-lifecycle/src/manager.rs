use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serverbox_auth::{build_auth_record, collect_provider_env, normalize_provider_auth};
use serverbox_domain::{
    InstanceId, InstanceRecord, InstanceState, LifecycleIntervals, ProviderAuthEntry, ResourceSpec,
};
use serverbox_provider::{
    check_health_once, wait_for_health, BootstrapConfig, BootstrapDriver, ExecOptions, HealthCreds,
    PreviewLink, ProviderAdapter, ProviderError, Sandbox, SandboxSpec, SandboxState,
};
use serverbox_store::InstanceStore;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::error::LifecycleError;

const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 60_000;
const HEALTH_POLL_MS: u64 = 1_000;
const PASSWORD_LEN: usize = 32;

/// Options accepted by [`LifecycleManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub id: Option<String>,
    pub auth: Option<Vec<ProviderAuthEntry>>,
    pub language: Option<String>,
    pub labels: HashMap<String, String>,
    pub resources: ResourceSpec,
    pub lifecycle: LifecycleIntervals,
    pub upstream_config: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Options accepted by [`LifecycleManager::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub state: Option<InstanceState>,
    pub labels: HashMap<String, String>,
    pub refresh: bool,
}

/// State machine over instance records, reconciling persisted state with the
/// sandbox provider's observed state. The sole writer to the metadata store.
pub struct LifecycleManager {
    store: Arc<dyn InstanceStore>,
    provider: Arc<dyn ProviderAdapter>,
    bootstrap: Arc<dyn BootstrapDriver>,
    http: reqwest::Client,
    upstream_port: u16,
    process_env: HashMap<String, String>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        provider: Arc<dyn ProviderAdapter>,
        bootstrap: Arc<dyn BootstrapDriver>,
        upstream_port: u16,
        process_env: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            provider,
            bootstrap,
            http: reqwest::Client::new(),
            upstream_port,
            process_env,
        }
    }

    pub async fn create(&self, opts: CreateOptions) -> Result<InstanceRecord, LifecycleError> {
        let id = InstanceId::new(opts.id.clone().unwrap_or_else(|| InstanceId::generate().0));
        let auth_entries = normalize_provider_auth(opts.auth.clone(), &self.process_env)?;
        let auth_record = build_auth_record(&auth_entries);
        let provider_env = collect_provider_env(&auth_entries);
        let providers: Vec<String> = auth_entries.iter().map(|e| e.provider.clone()).collect();
        let password = generate_password();
        let username = "serverbox".to_string();

        let mut env_vars = provider_env.clone();
        env_vars.insert("OPENCODE_USERNAME".into(), username.clone());
        env_vars.insert("OPENCODE_PASSWORD".into(), password.clone());

        let spec = SandboxSpec {
            id: Some(id.as_str().to_string()),
            language: opts.language.clone(),
            labels: opts.labels.clone(),
            resources: opts.resources.clone(),
            lifecycle: opts.lifecycle.clone(),
            env_vars,
        };

        let sandbox = self.create_sandbox_with_retry(&spec).await?;

        match self
            .finish_create(&sandbox, &id, &username, &password, &providers, &opts, &auth_record, &provider_env)
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(instance_id = %id, error = %e, "create failed after sandbox provisioned, tearing down");
                if let Err(cleanup_err) = self.provider.remove_sandbox(&sandbox).await {
                    warn!(instance_id = %id, error = %cleanup_err, "best-effort sandbox cleanup also failed");
                }
                Err(LifecycleError::CreateFailed(e.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_create(
        &self,
        sandbox: &Sandbox,
        id: &InstanceId,
        username: &str,
        password: &str,
        providers: &[String],
        opts: &CreateOptions,
        auth_record: &HashMap<String, String>,
        provider_env: &HashMap<String, String>,
    ) -> Result<InstanceRecord, LifecycleError> {
        self.bootstrap
            .bootstrap(
                sandbox,
                &BootstrapConfig {
                    username: username.to_string(),
                    password: password.to_string(),
                    provider_env: provider_env.clone(),
                    auth_record: Some(auth_record.clone()),
                    upstream_config: opts.upstream_config.clone(),
                    upstream_port: self.upstream_port,
                    install_upstream: true,
                },
            )
            .await?;

        let link = self
            .provider
            .get_preview_link(sandbox, self.upstream_port)
            .await?;

        let timeout_ms = opts.timeout_ms.unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS);
        wait_for_health(
            &self.http,
            &link.url,
            HealthCreds {
                username,
                password,
                preview_token: link.token.as_deref(),
            },
            timeout_ms,
            HEALTH_POLL_MS,
        )
        .await?;

        let now = Utc::now();
        let record = InstanceRecord::new_running(
            id.clone(),
            sandbox.id.clone(),
            link.url,
            link.token,
            username.to_string(),
            password.to_string(),
            providers.to_vec(),
            opts.labels.clone(),
            now,
        );
        self.store.set(&record).await?;
        info!(instance_id = %id, "instance created");
        Ok(record)
    }

    async fn create_sandbox_with_retry(&self, spec: &SandboxSpec) -> Result<Sandbox, LifecycleError> {
        const MAX_ATTEMPTS: u32 = 3;
        const BASE_DELAY_MS: u64 = 500;
        const MAX_DELAY_MS: u64 = 5_000;
        const JITTER_MS: u64 = 150;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.create_sandbox(spec).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let delay = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                    let jitter = rand::thread_rng().next_u64() % (JITTER_MS + 1);
                    warn!(attempt, error = %e, delay_ms = delay + jitter, "createSandbox failed, retrying");
                    sleep(Duration::from_millis(delay + jitter)).await;
                }
                Err(e) => {
                    return Err(LifecycleError::CreateFailed(e.to_string()));
                }
            }
        }
    }

    pub async fn get(&self, id: &InstanceId) -> Result<InstanceRecord, LifecycleError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(id.to_string()))?;
        self.sync_metadata(record).await
    }

    pub async fn list(&self, opts: ListOptions) -> Result<Vec<InstanceRecord>, LifecycleError> {
        let records = self.store.list().await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let record = if opts.refresh {
                match self.sync_metadata(record.clone()).await {
                    Ok(synced) => synced,
                    Err(e) => {
                        warn!(instance_id = %record.id, error = %e, "reconciliation failed, serving stored record");
                        record
                    }
                }
            } else {
                record
            };

            if let Some(state) = opts.state {
                if record.state != state {
                    continue;
                }
            }
            if !record.matches_labels(&opts.labels) {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    pub async fn stop(&self, id: &InstanceId) -> Result<InstanceRecord, LifecycleError> {
        let mut record = self.require_record(id).await?;
        let sandbox = self.sandbox_handle(&record);
        self.provider.stop_sandbox(&sandbox).await?;
        record.mark_stopped(Utc::now());
        self.store.set(&record).await?;
        info!(instance_id = %id, "instance stopped");
        Ok(record)
    }

    pub async fn resume(
        &self,
        id: &InstanceId,
        timeout_ms: Option<u64>,
    ) -> Result<InstanceRecord, LifecycleError> {
        let mut record = self.require_record(id).await?;
        let sandbox = self.sandbox_handle(&record);
        self.provider.start_sandbox(&sandbox).await?;

        self.bootstrap
            .bootstrap(
                &sandbox,
                &BootstrapConfig {
                    username: record.username.clone(),
                    password: record.password.clone(),
                    provider_env: HashMap::new(),
                    auth_record: None,
                    upstream_config: None,
                    upstream_port: self.upstream_port,
                    install_upstream: false,
                },
            )
            .await?;

        let link = self
            .provider
            .get_preview_link(&sandbox, self.upstream_port)
            .await?;
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS);
        wait_for_health(
            &self.http,
            &link.url,
            HealthCreds {
                username: &record.username,
                password: &record.password,
                preview_token: link.token.as_deref(),
            },
            timeout_ms,
            HEALTH_POLL_MS,
        )
        .await?;

        record.mark_running(link.url, link.token, Utc::now());
        self.store.set(&record).await?;
        info!(instance_id = %id, "instance resumed");
        Ok(record)
    }

    pub async fn archive(&self, id: &InstanceId) -> Result<InstanceRecord, LifecycleError> {
        let mut record = self.require_record(id).await?;
        let sandbox = self.sandbox_handle(&record);
        self.provider.archive_sandbox(&sandbox).await?;
        record.mark_archived(Utc::now());
        self.store.set(&record).await?;
        info!(instance_id = %id, "instance archived");
        Ok(record)
    }

    pub async fn destroy(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(());
        };
        let sandbox = self.sandbox_handle(&record);
        match self.provider.remove_sandbox(&sandbox).await {
            Ok(()) => {}
            Err(ProviderError::SandboxNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete(id).await?;
        info!(instance_id = %id, "instance destroyed");
        Ok(())
    }

    pub async fn health(&self, id: &InstanceId) -> Result<serde_json::Value, LifecycleError> {
        let record = self.require_running(id).await?;
        let url = record.url.clone().expect("running implies url");
        check_health_once(
            &self.http,
            &url,
            HealthCreds {
                username: &record.username,
                password: &record.password,
                preview_token: record.preview_token.as_deref(),
            },
        )
        .await
        .map_err(LifecycleError::from)
    }

    pub async fn exec(
        &self,
        id: &InstanceId,
        cmd: &str,
        opts: &ExecOptions,
    ) -> Result<serverbox_provider::ExecOutput, LifecycleError> {
        let record = self.require_running(id).await?;
        let sandbox = self.sandbox_handle(&record);
        Ok(self.provider.exec(&sandbox, cmd, opts).await?)
    }

    pub async fn upload_file(
        &self,
        id: &InstanceId,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<(), LifecycleError> {
        let record = self.require_running(id).await?;
        let sandbox = self.sandbox_handle(&record);
        Ok(self.provider.upload_file(&sandbox, path, contents).await?)
    }

    pub async fn download_file(&self, id: &InstanceId, path: &str) -> Result<Vec<u8>, LifecycleError> {
        let record = self.require_running(id).await?;
        let sandbox = self.sandbox_handle(&record);
        Ok(self.provider.download_file(&sandbox, path).await?)
    }

    // ── Internal helpers ──────────────────────────────────────────────────────

    async fn require_record(&self, id: &InstanceId) -> Result<InstanceRecord, LifecycleError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(id.to_string()))
    }

    async fn require_running(&self, id: &InstanceId) -> Result<InstanceRecord, LifecycleError> {
        let record = self.require_record(id).await?;
        if !record.is_running() {
            return Err(LifecycleError::InstanceNotRunning(id.to_string()));
        }
        Ok(record)
    }

    fn sandbox_handle(&self, record: &InstanceRecord) -> Sandbox {
        Sandbox {
            id: record.sandbox_id.clone(),
            state: SandboxState::Running,
            raw: serde_json::Value::Null,
        }
    }

    /// Reconcile a stored record against the provider's observed state. Only
    /// writes when the projected record differs from storage.
    async fn sync_metadata(&self, mut record: InstanceRecord) -> Result<InstanceRecord, LifecycleError> {
        let before = record.clone();
        match self.provider.find_sandbox(&record.sandbox_id).await {
            Err(ProviderError::SandboxNotFound(_)) => {
                record.mark_destroyed(Utc::now());
                self.store.set(&record).await?;
                return Ok(record);
            }
            Err(e) => return Err(e.into()),
            Ok(sandbox) => {
                let state = match sandbox.state {
                    SandboxState::Running => InstanceState::Running,
                    SandboxState::Stopped => InstanceState::Stopped,
                    SandboxState::Archived => InstanceState::Archived,
                    SandboxState::Destroyed => InstanceState::Destroyed,
                    SandboxState::Provisioning => InstanceState::Provisioning,
                    SandboxState::Error => InstanceState::Error,
                };

                if state == InstanceState::Running {
                    match self.provider.get_preview_link(&sandbox, self.upstream_port).await {
                        Ok(PreviewLink { url, token }) => {
                            record.mark_running(url, token, Utc::now());
                        }
                        Err(e) => {
                            warn!(instance_id = %record.id, error = %e, "preview link refresh failed during sync, degrading to error");
                            record.state = InstanceState::Error;
                            record.url = None;
                            record.preview_token = None;
                            record.updated_at = Utc::now();
                        }
                    }
                } else {
                    record.state = state;
                    record.url = None;
                    record.preview_token = None;
                    record.updated_at = Utc::now();
                }
            }
        }

        if records_differ(&before, &record) {
            self.store.set(&record).await?;
        }
        Ok(record)
    }
}

fn records_differ(a: &InstanceRecord, b: &InstanceRecord) -> bool {
    a.state != b.state || a.url != b.url || a.preview_token != b.preview_token
}

/// 32-char cryptographically random, base64url-encoded password.
fn generate_password() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    encoded.chars().take(PASSWORD_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serverbox_provider::LocalProviderAdapter;

    fn manager() -> LifecycleManager {
        let provider: Arc<dyn ProviderAdapter> = Arc::new(LocalProviderAdapter::new());
        let bootstrap = Arc::new(serverbox_provider::DefaultBootstrapDriver::new(provider.clone()));
        LifecycleManager::new(
            Arc::new(serverbox_store::MemoryStore::new()),
            provider,
            bootstrap,
            4096,
            HashMap::from([("OPENCODE_ZEN_API_KEY".to_string(), "zen-key".to_string())]),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let mgr = manager();
        let created = mgr
            .create(CreateOptions {
                id: Some("inst-1".into()),
                timeout_ms: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(created.is_running());

        let got = mgr.get(&InstanceId::new("inst-1")).await.unwrap();
        assert_eq!(got.state, created.state);
        assert_eq!(got.url, created.url);
    }

    #[tokio::test]
    async fn destroy_unknown_id_is_a_noop() {
        let mgr = manager();
        mgr.destroy(&InstanceId::new("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_twice_is_idempotent() {
        let mgr = manager();
        mgr.create(CreateOptions {
            id: Some("inst-2".into()),
            timeout_ms: Some(5_000),
            ..Default::default()
        })
        .await
        .unwrap();
        mgr.destroy(&InstanceId::new("inst-2")).await.unwrap();
        mgr.destroy(&InstanceId::new("inst-2")).await.unwrap();
        let err = mgr.get(&InstanceId::new("inst-2")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn stop_clears_url_and_token() {
        let mgr = manager();
        mgr.create(CreateOptions {
            id: Some("inst-3".into()),
            timeout_ms: Some(5_000),
            ..Default::default()
        })
        .await
        .unwrap();
        let stopped = mgr.stop(&InstanceId::new("inst-3")).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.url.is_none());
        assert!(stopped.preview_token.is_none());
    }

    #[tokio::test]
    async fn operations_on_stopped_instance_fail_not_running() {
        let mgr = manager();
        mgr.create(CreateOptions {
            id: Some("inst-4".into()),
            timeout_ms: Some(5_000),
            ..Default::default()
        })
        .await
        .unwrap();
        mgr.stop(&InstanceId::new("inst-4")).await.unwrap();
        let err = mgr
            .exec(&InstanceId::new("inst-4"), "echo hi", &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InstanceNotRunning(_)));
    }
}
