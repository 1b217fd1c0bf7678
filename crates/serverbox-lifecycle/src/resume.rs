use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serverbox_domain::{InstanceId, InstanceRecord};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::LifecycleError;
use crate::manager::LifecycleManager;

type SharedResume = Shared<BoxFuture<'static, Result<InstanceRecord, String>>>;

/// Deduplicates concurrent resume requests for the same instance: the first
/// caller drives the resume, later callers for the same id await the same
/// in-flight future rather than racing the provider's start/bootstrap path.
pub struct ResumeCoordinator {
    manager: Arc<LifecycleManager>,
    inflight: Arc<Mutex<HashMap<InstanceId, SharedResume>>>,
}

impl ResumeCoordinator {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            manager,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ensure `id` is running, waiting for an existing resume in flight if one
    /// is already underway. `wait_timeout_ms` bounds only how long this caller
    /// waits; it never cancels the underlying resume, which keeps running for
    /// whichever caller (or none) ends up waiting on it.
    pub async fn ensure_running(
        &self,
        id: &InstanceId,
        wait_timeout_ms: u64,
    ) -> Result<InstanceRecord, LifecycleError> {
        let record = self.manager.get(id).await?;
        if record.is_running() {
            return Ok(record);
        }

        let fut = self.join_or_spawn(id).await;

        match timeout(Duration::from_millis(wait_timeout_ms), fut).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(msg)) => {
                debug!(instance_id = %id, error = %msg, "resume failed");
                Err(LifecycleError::InstanceNotRunning(id.to_string()))
            }
            Err(_) => {
                debug!(instance_id = %id, wait_timeout_ms, "resume wait timed out");
                Err(LifecycleError::InstanceNotRunning(id.to_string()))
            }
        }
    }

    async fn join_or_spawn(&self, id: &InstanceId) -> SharedResume {
        let mut guard = self.inflight.lock().await;
        if let Some(existing) = guard.get(id) {
            debug!(instance_id = %id, "joining in-flight resume");
            return existing.clone();
        }

        let manager = self.manager.clone();
        let resume_id = id.clone();
        let task: BoxFuture<'static, Result<InstanceRecord, String>> = async move {
            manager
                .resume(&resume_id, None)
                .await
                .map_err(|e| e.to_string())
        }
        .boxed();
        let shared: SharedResume = task.shared();

        guard.insert(id.clone(), shared.clone());
        drop(guard);

        let cleanup_id = id.clone();
        let cleanup_fut = shared.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            let _ = cleanup_fut.await;
            inflight.lock().await.remove(&cleanup_id);
        });

        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serverbox_provider::{
        DefaultBootstrapDriver, ExecOptions, ExecOutput, LocalProviderAdapter, PreviewLink,
        ProviderAdapter, ProviderError, Sandbox, SandboxSpec,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_manager() -> Arc<LifecycleManager> {
        let provider: Arc<dyn ProviderAdapter> = Arc::new(LocalProviderAdapter::new());
        let bootstrap = Arc::new(DefaultBootstrapDriver::new(provider.clone()));
        Arc::new(LifecycleManager::new(
            Arc::new(serverbox_store::MemoryStore::new()),
            provider,
            bootstrap,
            4096,
            HashMap::from([("OPENCODE_ZEN_API_KEY".to_string(), "zen-key".to_string())]),
        ))
    }

    /// Wraps [`LocalProviderAdapter`], counting calls into `start_sandbox` so
    /// tests can assert the resume path is driven exactly once even when many
    /// callers race `ensure_running` for the same instance.
    #[derive(Debug, Default)]
    struct CountingProviderAdapter {
        inner: LocalProviderAdapter,
        start_sandbox_calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for CountingProviderAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox, ProviderError> {
            self.inner.create_sandbox(spec).await
        }

        async fn find_sandbox(&self, id: &str) -> Result<Sandbox, ProviderError> {
            self.inner.find_sandbox(id).await
        }

        async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, ProviderError> {
            self.inner.list_sandboxes().await
        }

        async fn remove_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
            self.inner.remove_sandbox(sandbox).await
        }

        async fn start_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
            self.start_sandbox_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.start_sandbox(sandbox).await
        }

        async fn stop_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
            self.inner.stop_sandbox(sandbox).await
        }

        async fn archive_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
            self.inner.archive_sandbox(sandbox).await
        }

        async fn get_preview_link(
            &self,
            sandbox: &Sandbox,
            port: u16,
        ) -> Result<PreviewLink, ProviderError> {
            self.inner.get_preview_link(sandbox, port).await
        }

        async fn exec(
            &self,
            sandbox: &Sandbox,
            cmd: &str,
            opts: &ExecOptions,
        ) -> Result<ExecOutput, ProviderError> {
            self.inner.exec(sandbox, cmd, opts).await
        }

        async fn upload_file(
            &self,
            sandbox: &Sandbox,
            path: &str,
            contents: Vec<u8>,
        ) -> Result<(), ProviderError> {
            self.inner.upload_file(sandbox, path, contents).await
        }

        async fn download_file(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<u8>, ProviderError> {
            self.inner.download_file(sandbox, path).await
        }
    }

    #[tokio::test]
    async fn ensure_running_is_a_noop_when_already_running() {
        let manager = test_manager();
        manager
            .create(crate::manager::CreateOptions {
                id: Some("res-1".into()),
                timeout_ms: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();

        let coordinator = ResumeCoordinator::new(manager);
        let record = coordinator
            .ensure_running(&InstanceId::new("res-1"), 5_000)
            .await
            .unwrap();
        assert!(record.is_running());
    }

    #[tokio::test]
    async fn concurrent_resumes_share_one_underlying_resume() {
        let manager = test_manager();
        manager
            .create(crate::manager::CreateOptions {
                id: Some("res-2".into()),
                timeout_ms: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.stop(&InstanceId::new("res-2")).await.unwrap();

        let coordinator = Arc::new(ResumeCoordinator::new(manager));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                coordinator
                    .ensure_running(&InstanceId::new("res-2"), 5_000)
                    .await
            }));
        }

        for h in handles {
            assert!(h.await.unwrap().unwrap().is_running());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn concurrent_resumes_drive_the_provider_exactly_once() {
        let counting = Arc::new(CountingProviderAdapter::default());
        let provider: Arc<dyn ProviderAdapter> = counting.clone();
        let bootstrap = Arc::new(DefaultBootstrapDriver::new(provider.clone()));
        let manager = Arc::new(LifecycleManager::new(
            Arc::new(serverbox_store::MemoryStore::new()),
            provider,
            bootstrap,
            4096,
            HashMap::from([("OPENCODE_ZEN_API_KEY".to_string(), "zen-key".to_string())]),
        ));
        manager
            .create(crate::manager::CreateOptions {
                id: Some("res-3".into()),
                timeout_ms: Some(5_000),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.stop(&InstanceId::new("res-3")).await.unwrap();

        let coordinator = Arc::new(ResumeCoordinator::new(manager));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .ensure_running(&InstanceId::new("res-3"), 5_000)
                    .await
            }));
        }

        for h in handles {
            assert!(h.await.unwrap().unwrap().is_running());
        }
        assert_eq!(counting.start_sandbox_calls.load(Ordering::SeqCst), 1);
    }
}
