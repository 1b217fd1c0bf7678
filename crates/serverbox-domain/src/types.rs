use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(s: impl Into<String>) -> Self {
        InstanceId(s.into())
    }

    /// Generate a fresh randomly-derived id.
    pub fn generate() -> Self {
        InstanceId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Lifecycle state machine ───────────────────────────────────────────────────

/// The lifecycle state of an instance.
///
/// Transitions:
///   Provisioning → Bootstrapping → Running
///   Running ↔ Stopped (stop / resume)
///   Running ↔ Archived (archive / resume)
///   any → Error (on unrecoverable failure; stays queryable)
///   Running | Stopped | Archived | Error → Destroyed (terminal; record removed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Bootstrapping,
    Running,
    Stopped,
    Archived,
    Error,
    Destroyed,
}

impl InstanceState {
    /// Parse a persisted state string, degrading unknown values to `Error`
    /// rather than failing the read.
    pub fn from_persisted(s: &str) -> Self {
        match s {
            "provisioning" => InstanceState::Provisioning,
            "bootstrapping" => InstanceState::Bootstrapping,
            "running" => InstanceState::Running,
            "stopped" => InstanceState::Stopped,
            "archived" => InstanceState::Archived,
            "destroyed" => InstanceState::Destroyed,
            _ => InstanceState::Error,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Bootstrapping => "bootstrapping",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Archived => "archived",
            InstanceState::Error => "error",
            InstanceState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

// ── Instance Record ───────────────────────────────────────────────────────────

/// Durable metadata binding an instance id to its backing sandbox, upstream
/// credentials, and last-known reachability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub sandbox_id: String,
    pub state: InstanceState,
    pub url: Option<String>,
    pub preview_token: Option<String>,
    pub username: String,
    pub password: String,
    pub providers: Vec<String>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Construct a freshly-provisioned record in `running` state. Callers
    /// assemble this only after sandbox creation, bootstrap, and the health
    /// wait have all succeeded — `provisioning`/`bootstrapping` are transient
    /// and never themselves persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn new_running(
        id: InstanceId,
        sandbox_id: String,
        url: String,
        preview_token: Option<String>,
        username: String,
        password: String,
        providers: Vec<String>,
        labels: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        InstanceRecord {
            id,
            sandbox_id,
            state: InstanceState::Running,
            url: Some(url),
            preview_token,
            username,
            password,
            providers,
            labels,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a value-copied view of `providers`/`labels` safe to hand to a
    /// caller without aliasing internal state (invariant 5).
    pub fn providers_copy(&self) -> Vec<String> {
        self.providers.clone()
    }

    pub fn labels_copy(&self) -> HashMap<String, String> {
        self.labels.clone()
    }

    pub fn mark_running(&mut self, url: String, preview_token: Option<String>, now: DateTime<Utc>) {
        self.state = InstanceState::Running;
        self.url = Some(url);
        self.preview_token = preview_token;
        self.updated_at = now;
    }

    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.state = InstanceState::Stopped;
        self.url = None;
        self.preview_token = None;
        self.updated_at = now;
    }

    pub fn mark_archived(&mut self, now: DateTime<Utc>) {
        self.state = InstanceState::Archived;
        self.url = None;
        self.preview_token = None;
        self.updated_at = now;
    }

    pub fn mark_destroyed(&mut self, now: DateTime<Utc>) {
        self.state = InstanceState::Destroyed;
        self.url = None;
        self.preview_token = None;
        self.updated_at = now;
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>) {
        self.state = InstanceState::Error;
        self.url = None;
        self.preview_token = None;
        self.updated_at = now;
    }

    /// `true` once `state` and `url` satisfy invariant 1's running predicate.
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running && self.url.is_some()
    }

    /// Whether `labels` is a subset-match of `filter` (every key in `filter`
    /// present in `self.labels` with an equal value).
    pub fn matches_labels(&self, filter: &HashMap<String, String>) -> bool {
        filter.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

// ── Create options ────────────────────────────────────────────────────────────

/// Resource quotas requested for a freshly created sandbox. All optional;
/// `None` defers to the provider's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: Option<u32>,
    pub mem: Option<u32>,
    pub disk: Option<u32>,
}

/// Provider-side auto-lifecycle intervals, in minutes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleIntervals {
    pub auto_stop_minutes: Option<u32>,
    pub auto_archive_minutes: Option<u32>,
    pub auto_delete_minutes: Option<u32>,
}

/// A single `{provider, apiKey?, env?}` credential entry accepted by the
/// auth normalizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAuthEntry {
    pub provider: String,
    pub api_key: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_persisted_state_degrades_to_error() {
        assert_eq!(InstanceState::from_persisted("quux"), InstanceState::Error);
        assert_eq!(InstanceState::from_persisted("running"), InstanceState::Running);
    }

    #[test]
    fn running_requires_url() {
        let now = Utc::now();
        let mut rec = InstanceRecord::new_running(
            InstanceId::new("i1"),
            "sbx-1".into(),
            "http://u".into(),
            Some("tok".into()),
            "user".into(),
            "pw".into(),
            vec!["opencode".into()],
            HashMap::new(),
            now,
        );
        assert!(rec.is_running());
        rec.mark_stopped(now);
        assert!(!rec.is_running());
        assert!(rec.url.is_none());
        assert!(rec.preview_token.is_none());
    }

    #[test]
    fn providers_and_labels_copy_does_not_alias() {
        let now = Utc::now();
        let rec = InstanceRecord::new_running(
            InstanceId::new("i1"),
            "sbx-1".into(),
            "http://u".into(),
            None,
            "user".into(),
            "pw".into(),
            vec!["opencode".into()],
            HashMap::new(),
            now,
        );
        let mut copy = rec.providers_copy();
        copy.push("extra".into());
        assert_eq!(rec.providers.len(), 1);
    }

    #[test]
    fn matches_labels_is_subset_match() {
        let now = Utc::now();
        let mut rec = InstanceRecord::new_running(
            InstanceId::new("i1"),
            "sbx-1".into(),
            "http://u".into(),
            None,
            "user".into(),
            "pw".into(),
            vec![],
            HashMap::new(),
            now,
        );
        rec.labels.insert("env".into(), "prod".into());
        rec.labels.insert("team".into(), "infra".into());

        let mut filter = HashMap::new();
        filter.insert("env".into(), "prod".into());
        assert!(rec.matches_labels(&filter));

        filter.insert("team".into(), "other".into());
        assert!(!rec.matches_labels(&filter));
    }
}
