use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ProviderError;

/// Basic-auth credentials and optional preview token used to reach the
/// upstream server's health endpoint.
pub struct HealthCreds<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub preview_token: Option<&'a str>,
}

/// Poll `GET {base_url}/global/health` until the body reports `healthy: true`
/// or `timeout_ms` elapses. `timeout_ms = 0` fails on the first check without
/// ever issuing a request.
pub async fn wait_for_health(
    client: &reqwest::Client,
    base_url: &str,
    creds: HealthCreds<'_>,
    timeout_ms: u64,
    poll_ms: u64,
) -> Result<Value, ProviderError> {
    let url = format!("{}/global/health", base_url.trim_end_matches('/'));
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut last_err = String::from("health check never attempted");

    loop {
        if Instant::now() >= deadline {
            return Err(ProviderError::HealthCheckFailed(last_err));
        }

        let mut req = client.get(&url).basic_auth(creds.username, Some(creds.password));
        if let Some(token) = creds.preview_token {
            req = req.header("x-daytona-preview-token", token);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) if body.get("healthy").and_then(Value::as_bool) == Some(true) => {
                    return Ok(body);
                }
                Ok(body) => {
                    last_err = format!("not healthy: {body}");
                }
                Err(e) => {
                    last_err = format!("invalid health body: {e}");
                }
            },
            Ok(resp) => {
                last_err = format!("health check returned {}", resp.status());
            }
            Err(e) => {
                last_err = format!("health request failed: {e}");
            }
        }

        debug!(url, last_err, "health check not yet passing, retrying");
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProviderError::HealthCheckFailed(last_err));
        }
        tokio::time::sleep(Duration::from_millis(poll_ms).min(remaining)).await;
    }
}

/// Issue a single `GET {base_url}/global/health` request, no retry loop.
/// Used when an instance is already known `running` and a caller wants its
/// current health body rather than a wait-until-healthy guarantee.
pub async fn check_health_once(
    client: &reqwest::Client,
    base_url: &str,
    creds: HealthCreds<'_>,
) -> Result<Value, ProviderError> {
    let url = format!("{}/global/health", base_url.trim_end_matches('/'));
    let mut req = client.get(&url).basic_auth(creds.username, Some(creds.password));
    if let Some(token) = creds.preview_token {
        req = req.header("x-daytona-preview-token", token);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| ProviderError::HealthCheckFailed(format!("health request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(ProviderError::HealthCheckFailed(format!(
            "health check returned {}",
            resp.status()
        )));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| ProviderError::HealthCheckFailed(format!("invalid health body: {e}")))
}
