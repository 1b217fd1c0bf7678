use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{
    ExecOptions, ExecOutput, PreviewLink, ProviderAdapter, Sandbox, SandboxSpec, SandboxState,
};
use crate::error::ProviderError;

/// Static configuration for the Daytona-backed adapter, injected at startup.
#[derive(Clone)]
pub struct DaytonaConfig {
    pub api_url: String,
    pub api_key: String,
    /// Optional target/region hint passed through to every create call.
    pub target: Option<String>,
}

/// Talks to the external sandbox provider over its REST API. Every call is a
/// single HTTP round-trip; there is no SDK crate to wrap, so requests are
/// built directly with `reqwest`.
pub struct DaytonaProviderAdapter {
    config: DaytonaConfig,
    client: reqwest::Client,
}

impl DaytonaProviderAdapter {
    pub fn new(config: DaytonaConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Extract a readable message from the provider's error envelope. Tries
    /// `{"message": ...}` then `{"error": ...}`, else falls back to the raw
    /// body.
    fn extract_error(body: &Value) -> String {
        if let Some(m) = body.get("message").and_then(Value::as_str) {
            return m.to_string();
        }
        if let Some(m) = body.get("error").and_then(Value::as_str) {
            return m.to_string();
        }
        body.to_string()
    }

    async fn send_json(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Value, ProviderError> {
        let resp = req
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .unwrap_or_else(|_| json!({ "message": "non-JSON response body" }));

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::SandboxNotFound(Self::extract_error(&body)));
        }
        if !status.is_success() {
            return Err(ProviderError::ApiError(format!(
                "{status}: {}",
                Self::extract_error(&body)
            )));
        }
        Ok(body)
    }

    fn sandbox_from_json(v: &Value) -> Sandbox {
        let id = v["id"].as_str().unwrap_or_default().to_string();
        let state = SandboxState::normalize(v["state"].as_str().unwrap_or("unknown"));
        Sandbox {
            id,
            state,
            raw: v.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for DaytonaProviderAdapter {
    fn name(&self) -> &'static str {
        "daytona"
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<Sandbox, ProviderError> {
        debug!(sandbox_id = ?spec.id, "daytona: create_sandbox");
        let mut body = json!({
            "language": spec.language,
            "labels": spec.labels,
            "envVars": spec.env_vars,
            "autoStopInterval": spec.lifecycle.auto_stop_minutes,
            "autoArchiveInterval": spec.lifecycle.auto_archive_minutes,
            "resources": {
                "cpu": spec.resources.cpu,
                "memory": spec.resources.mem,
                "disk": spec.resources.disk,
            },
        });
        if let Some(id) = &spec.id {
            body["id"] = json!(id);
        }
        if let Some(interval) = spec.lifecycle.auto_delete_minutes {
            body["autoDeleteInterval"] = json!(interval);
        }
        if let Some(target) = &self.config.target {
            body["target"] = json!(target);
        }

        let req = self.client.post(self.url("/sandbox")).json(&body);
        let resp = self.send_json(req).await?;
        Ok(Self::sandbox_from_json(&resp))
    }

    async fn find_sandbox(&self, id: &str) -> Result<Sandbox, ProviderError> {
        let req = self.client.get(self.url(&format!("/sandbox/{id}")));
        let resp = self.send_json(req).await?;
        Ok(Self::sandbox_from_json(&resp))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, ProviderError> {
        let req = self.client.get(self.url("/sandbox"));
        let resp = self.send_json(req).await?;
        let items = resp
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| resp.as_array().cloned())
            .unwrap_or_default();
        Ok(items.iter().map(Self::sandbox_from_json).collect())
    }

    async fn remove_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        let req = self
            .client
            .delete(self.url(&format!("/sandbox/{}", sandbox.id)));
        match self.send_json(req).await {
            Ok(_) => Ok(()),
            Err(ProviderError::SandboxNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn start_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        let req = self
            .client
            .post(self.url(&format!("/sandbox/{}/start", sandbox.id)));
        self.send_json(req).await.map(|_| ())
    }

    async fn stop_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        let req = self
            .client
            .post(self.url(&format!("/sandbox/{}/stop", sandbox.id)));
        self.send_json(req).await.map(|_| ())
    }

    async fn archive_sandbox(&self, sandbox: &Sandbox) -> Result<(), ProviderError> {
        let req = self
            .client
            .post(self.url(&format!("/sandbox/{}/archive", sandbox.id)));
        self.send_json(req).await.map(|_| ())
    }

    async fn get_preview_link(
        &self,
        sandbox: &Sandbox,
        port: u16,
    ) -> Result<PreviewLink, ProviderError> {
        let req = self.client.get(self.url(&format!(
            "/sandbox/{}/ports/{port}/preview-link",
            sandbox.id
        )));
        let resp = self.send_json(req).await?;
        // Accepts either a bare string (token null) or `{url, token}`.
        if let Some(url) = resp.as_str() {
            return Ok(PreviewLink {
                url: url.to_string(),
                token: None,
            });
        }
        let url = resp["url"]
            .as_str()
            .ok_or_else(|| ProviderError::ApiError("preview link missing url".into()))?
            .to_string();
        let token = resp.get("token").and_then(Value::as_str).map(str::to_string);
        Ok(PreviewLink { url, token })
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, ProviderError> {
        let body = json!({
            "command": cmd,
            "cwd": opts.cwd,
            "timeout": opts.timeout_ms,
        });
        let req = self
            .client
            .post(self.url(&format!("/toolbox/{}/process/execute", sandbox.id)))
            .json(&body);
        let resp = self.send_json(req).await?;
        Ok(ExecOutput {
            exit_code: resp["exitCode"].as_i64().unwrap_or(-1) as i32,
            stdout: resp["result"].as_str().unwrap_or_default().to_string(),
            stderr: resp["stderr"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn upload_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let req = self
            .client
            .post(self.url(&format!("/toolbox/{}/files/upload", sandbox.id)))
            .query(&[("path", path)])
            .body(contents);
        let resp = req
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProviderError::ApiError(format!(
                "upload {path}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn download_file(&self, sandbox: &Sandbox, path: &str) -> Result<Vec<u8>, ProviderError> {
        let resp = self
            .client
            .get(self.url(&format!("/toolbox/{}/files/download", sandbox.id)))
            .query(&[("path", path)])
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::ApiError(format!("no such file: {path}")));
        }
        if !resp.status().is_success() {
            return Err(ProviderError::ApiError(format!(
                "download {path}: {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> DaytonaProviderAdapter {
        DaytonaProviderAdapter::new(DaytonaConfig {
            api_url: server.uri(),
            api_key: "test-key".into(),
            target: None,
        })
    }

    #[tokio::test]
    async fn create_sandbox_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandbox"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sbx-1",
                "state": "started",
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let sandbox = adapter
            .create_sandbox(&SandboxSpec::default())
            .await
            .unwrap();
        assert_eq!(sandbox.id, "sbx-1");
        assert_eq!(sandbox.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn find_sandbox_404_surfaces_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "no such sandbox"})))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let err = adapter.find_sandbox("missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::SandboxNotFound(_)));
    }

    #[tokio::test]
    async fn remove_sandbox_tolerates_already_gone() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/sandbox/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "gone"})))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let sandbox = Sandbox {
            id: "gone".into(),
            state: SandboxState::Running,
            raw: Value::Null,
        };
        adapter.remove_sandbox(&sandbox).await.unwrap();
    }

    #[tokio::test]
    async fn preview_link_accepts_bare_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/sbx-1/ports/8080/preview-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("http://preview.invalid")))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let sandbox = Sandbox {
            id: "sbx-1".into(),
            state: SandboxState::Running,
            raw: Value::Null,
        };
        let link = adapter.get_preview_link(&sandbox, 8080).await.unwrap();
        assert_eq!(link.url, "http://preview.invalid");
        assert!(link.token.is_none());
    }
}
