use std::collections::HashMap;

use serverbox_domain::ProviderAuthEntry;
use tracing::debug;

use crate::error::AuthError;

const ZEN_KEY_VAR: &str = "OPENCODE_ZEN_API_KEY";
const LEGACY_KEY_VAR: &str = "OPENCODE_API_KEY";

/// Validate and canonicalize a caller-supplied list of provider credential
/// entries.
///
/// `entries = None` means the caller supplied nothing at all; `entries =
/// Some(vec![])` means the caller explicitly supplied an empty list. Both are
/// rejected, but only the former falls back to synthesizing an entry from the
/// process environment.
pub fn normalize_provider_auth(
    entries: Option<Vec<ProviderAuthEntry>>,
    env: &HashMap<String, String>,
) -> Result<Vec<ProviderAuthEntry>, AuthError> {
    let entries = match entries {
        None => {
            let zen_key = env.get(ZEN_KEY_VAR).or_else(|| env.get(LEGACY_KEY_VAR));
            match zen_key {
                Some(key) => {
                    debug!(var = if env.contains_key(ZEN_KEY_VAR) { ZEN_KEY_VAR } else { LEGACY_KEY_VAR }, "synthesizing opencode auth entry from environment");
                    vec![ProviderAuthEntry {
                        provider: "opencode".to_string(),
                        api_key: Some(key.clone()),
                        env: HashMap::new(),
                    }]
                }
                None => return Err(AuthError::MissingAuth),
            }
        }
        Some(v) if v.is_empty() => return Err(AuthError::MissingAuth),
        Some(v) => v,
    };

    for entry in &entries {
        if entry.provider.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "provider name must not be empty".into(),
            ));
        }
        let has_key = entry.api_key.as_ref().is_some_and(|k| !k.is_empty());
        let has_env = !entry.env.is_empty();
        if !has_key && !has_env {
            return Err(AuthError::InvalidConfig(format!(
                "provider '{}' must carry an apiKey or env map",
                entry.provider
            )));
        }
    }

    Ok(dedup_keep_last(entries))
}

/// Dedup entries by provider, keeping the last occurrence's value but the
/// first occurrence's position (insertion order of first appearance).
fn dedup_keep_last(entries: Vec<ProviderAuthEntry>) -> Vec<ProviderAuthEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut by_provider: HashMap<String, ProviderAuthEntry> = HashMap::new();

    for entry in entries {
        if !by_provider.contains_key(&entry.provider) {
            order.push(entry.provider.clone());
        }
        by_provider.insert(entry.provider.clone(), entry);
    }

    order
        .into_iter()
        .map(|p| by_provider.remove(&p).expect("provider tracked in order"))
        .collect()
}

/// `{provider -> apiKey}`, excluding entries that carry no `apiKey`.
pub fn build_auth_record(entries: &[ProviderAuthEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|e| e.api_key.clone().map(|k| (e.provider.clone(), k)))
        .collect()
}

/// Merge every entry's `env` map; later entries in `entries` win on key
/// collision.
pub fn collect_provider_env(entries: &[ProviderAuthEntry]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for entry in entries {
        for (k, v) in &entry.env {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, key: &str) -> ProviderAuthEntry {
        ProviderAuthEntry {
            provider: provider.into(),
            api_key: Some(key.into()),
            env: HashMap::new(),
        }
    }

    #[test]
    fn auth_default_synthesizes_from_zen_key() {
        let mut env = HashMap::new();
        env.insert(ZEN_KEY_VAR.to_string(), "zen-key".to_string());
        let out = normalize_provider_auth(None, &env).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].provider, "opencode");
        assert_eq!(out[0].api_key.as_deref(), Some("zen-key"));
    }

    #[test]
    fn auth_missing_without_env_fails() {
        let env = HashMap::new();
        let err = normalize_provider_auth(None, &env).unwrap_err();
        assert!(matches!(err, AuthError::MissingAuth));
    }

    #[test]
    fn explicit_empty_list_fails_without_env_fallback() {
        let mut env = HashMap::new();
        env.insert(ZEN_KEY_VAR.to_string(), "zen-key".to_string());
        let err = normalize_provider_auth(Some(vec![]), &env).unwrap_err();
        assert!(matches!(err, AuthError::MissingAuth));
    }

    #[test]
    fn auth_dedup_keeps_last_value_first_position() {
        let input = vec![
            entry("opencode", "old"),
            entry("opencode", "new"),
            entry("openai", "x"),
        ];
        let out = normalize_provider_auth(Some(input), &HashMap::new()).unwrap();
        let providers: Vec<&str> = out.iter().map(|e| e.provider.as_str()).collect();
        assert_eq!(providers, vec!["opencode", "openai"]);

        let record = build_auth_record(&out);
        assert_eq!(record.get("opencode").map(String::as_str), Some("new"));
        assert_eq!(record.get("openai").map(String::as_str), Some("x"));
    }

    #[test]
    fn entry_without_key_or_env_is_invalid() {
        let bad = ProviderAuthEntry {
            provider: "opencode".into(),
            api_key: None,
            env: HashMap::new(),
        };
        let err = normalize_provider_auth(Some(vec![bad]), &HashMap::new()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfig(_)));
    }

    #[test]
    fn collect_provider_env_later_entries_win() {
        let mut e1_env = HashMap::new();
        e1_env.insert("FOO".to_string(), "one".to_string());
        let e1 = ProviderAuthEntry {
            provider: "a".into(),
            api_key: Some("k".into()),
            env: e1_env,
        };
        let mut e2_env = HashMap::new();
        e2_env.insert("FOO".to_string(), "two".to_string());
        let e2 = ProviderAuthEntry {
            provider: "b".into(),
            api_key: Some("k".into()),
            env: e2_env,
        };
        let merged = collect_provider_env(&[e1, e2]);
        assert_eq!(merged.get("FOO").map(String::as_str), Some("two"));
    }
}
