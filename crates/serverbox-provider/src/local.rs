use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::adapter::{
    ExecOptions, ExecOutput, PreviewLink, ProviderAdapter, Sandbox, SandboxSpec, SandboxState,
};
use crate::error::ProviderError;

/// A stub provider adapter that simulates a sandbox provider locally.
///
/// Sandbox state lives in an in-process map and file transfer writes into an
/// in-memory virtual filesystem keyed by sandbox id — no real sandbox is ever
/// provisioned. Each sandbox does get a real loopback listener standing in
/// for its upstream server, so `get_preview_link`'s URL is actually reachable
/// and `wait_for_health` succeeds without a live Daytona account. Used for
/// local development (`DAYTONA_API_KEY` unset) and by every higher-level
/// crate's tests.
#[derive(Debug, Default, Clone)]
pub struct LocalProviderAdapter {
    sandboxes: Arc<RwLock<HashMap<String, Sandbox>>>,
    files: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
    stubs: Arc<RwLock<HashMap<String, (std::net::SocketAddr, Arc<JoinHandle<()>>)>>>,
}

impl LocalProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spins up a loopback listener that answers every request with
    /// `{"healthy": true}`, mimicking the upstream server's `/global/health`
    /// endpoint closely enough for `wait_for_health` to pass.
    async fn spawn_stub_server() -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local stub server");
        let addr = listener.local_addr().expect("stub server local addr");

        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let body = br#"{"healthy":true}"#;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (addr, handle)
    }
}

#[async_trait]
impl ProviderAdapter for LocalProviderAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox, ProviderError> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(sandbox_id = %id, "LocalProviderAdapter: create_sandbox");
        let sandbox = Sandbox {
            id: id.clone(),
            state: SandboxState::Running,
            raw: json!({ "driver": "local", "id": id, "labels": spec.labels }),
        };
        self.sandboxes.write().await.insert(id.clone(), sandbox.clone());
        let (addr, handle) = Self::spawn_stub_server().await;
        self.stubs.write().await.insert(id, (addr, Arc::new(handle)));
        Ok(sandbox)
    }

    async fn find_sandbox(&self, id: &str) -> Result<Sandbox, ProviderError> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::SandboxNotFound(id.to_string()))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, ProviderError> {
        Ok(self.sandboxes.read().await.values().cloned().collect())
    }

    async fn remove_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        self.sandboxes.write().await.remove(&sandbox.id);
        if let Some((_, handle)) = self.stubs.write().await.remove(&sandbox.id) {
            handle.abort();
        }
        Ok(())
    }

    async fn start_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        self.set_state(&sandbox.id, SandboxState::Running).await
    }

    async fn stop_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        self.set_state(&sandbox.id, SandboxState::Stopped).await
    }

    async fn archive_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        self.set_state(&sandbox.id, SandboxState::Archived).await
    }

    async fn get_preview_link(
        &self,
        sandbox: &Sandbox,
        _port: u16,
    ) -> Result<PreviewLink, ProviderError> {
        let addr = self
            .stubs
            .read()
            .await
            .get(&sandbox.id)
            .map(|(addr, _)| *addr)
            .ok_or_else(|| ProviderError::SandboxNotFound(sandbox.id.clone()))?;
        Ok(PreviewLink {
            url: format!("http://{addr}"),
            token: Some(format!("local-token-{}", sandbox.id)),
        })
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        _opts: &ExecOptions,
    ) -> Result<ExecOutput, ProviderError> {
        debug!(sandbox_id = %sandbox.id, cmd, "LocalProviderAdapter: exec");
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("ran: {cmd}"),
            stderr: String::new(),
        })
    }

    async fn upload_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<(), ProviderError> {
        self.files
            .write()
            .await
            .insert((sandbox.id.clone(), path.to_string()), contents);
        Ok(())
    }

    async fn download_file(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<u8>, ProviderError> {
        self.files
            .read()
            .await
            .get(&(sandbox.id.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::ApiError(format!("no such file: {path}")))
    }
}

impl LocalProviderAdapter {
    async fn set_state(&self, id: &str, state: SandboxState) -> Result<(), ProviderError> {
        let mut guard = self.sandboxes.write().await;
        let sandbox = guard
            .get_mut(id)
            .ok_or_else(|| ProviderError::SandboxNotFound(id.to_string()))?;
        sandbox.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let adapter = LocalProviderAdapter::new();
        let spec = SandboxSpec {
            id: Some("sbx-1".into()),
            ..Default::default()
        };
        let sandbox = adapter.create_sandbox(&spec).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::Running);

        let found = adapter.find_sandbox("sbx-1").await.unwrap();
        assert_eq!(found.id, "sbx-1");
    }

    #[tokio::test]
    async fn find_unknown_sandbox_fails_not_found() {
        let adapter = LocalProviderAdapter::new();
        let err = adapter.find_sandbox("nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::SandboxNotFound(_)));
    }

    #[tokio::test]
    async fn stop_then_start_round_trips_state() {
        let adapter = LocalProviderAdapter::new();
        let spec = SandboxSpec {
            id: Some("sbx-2".into()),
            ..Default::default()
        };
        let sandbox = adapter.create_sandbox(&spec).await.unwrap();
        adapter.stop_sandbox(&sandbox).await.unwrap();
        assert_eq!(
            adapter.find_sandbox("sbx-2").await.unwrap().state,
            SandboxState::Stopped
        );
        adapter.start_sandbox(&sandbox).await.unwrap();
        assert_eq!(
            adapter.find_sandbox("sbx-2").await.unwrap().state,
            SandboxState::Running
        );
    }

    #[tokio::test]
    async fn preview_link_is_actually_reachable() {
        let adapter = LocalProviderAdapter::new();
        let sandbox = adapter
            .create_sandbox(&SandboxSpec {
                id: Some("sbx-4".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let link = adapter.get_preview_link(&sandbox, 4096).await.unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{}/global/health", link.url))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["healthy"], true);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let adapter = LocalProviderAdapter::new();
        let sandbox = adapter
            .create_sandbox(&SandboxSpec {
                id: Some("sbx-3".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        adapter
            .upload_file(&sandbox, "/etc/config", b"hello".to_vec())
            .await
            .unwrap();
        let back = adapter.download_file(&sandbox, "/etc/config").await.unwrap();
        assert_eq!(back, b"hello");
    }
}
