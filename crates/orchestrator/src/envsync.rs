use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// The encrypted key-value sync that distributes project `.env` files to
/// workers. The store itself is an external collaborator; the orchestrator
/// only needs fetch.
#[async_trait]
pub trait EnvSync: Send + Sync {
    /// Synced env for a project, already decrypted.
    async fn fetch(&self, project: &str) -> Result<HashMap<String, String>>;
}

/// Used when no sync passphrase is configured: workers run with whatever
/// env files already exist on the machine.
pub struct NullEnvSync;

#[async_trait]
impl EnvSync for NullEnvSync {
    async fn fetch(&self, _project: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Merge synced and machine-local env. Shared keys are remote-wins so a
/// rotated secret propagates everywhere; machine-specific keys (listed in
/// config or `LOCAL_`-prefixed) are local-wins because they describe the
/// machine, not the project.
pub fn merge_env(
    synced: &HashMap<String, String>,
    local: &HashMap<String, String>,
    machine_local_keys: &[String],
) -> BTreeMap<String, String> {
    let is_machine_local =
        |key: &str| key.starts_with("LOCAL_") || machine_local_keys.iter().any(|k| k == key);

    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in local {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in synced {
        if is_machine_local(k) && local.contains_key(k) {
            continue;
        }
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Render a merged env as `.env` file content (sorted, one KEY=VALUE per
/// line).
pub fn render_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in env {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    out
}

/// Parse `.env` file content (KEY=VALUE lines; `#` comments and blanks
/// ignored).
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            env.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn shared_keys_remote_wins() {
        let synced = map(&[("API_KEY", "new")]);
        let local = map(&[("API_KEY", "old")]);
        let merged = merge_env(&synced, &local, &[]);
        assert_eq!(merged["API_KEY"], "new");
    }

    #[test]
    fn machine_local_keys_local_wins() {
        let synced = map(&[("LOCAL_GPU", "none"), ("DB_SOCKET", "/sync/db")]);
        let local = map(&[("LOCAL_GPU", "a100"), ("DB_SOCKET", "/var/run/db")]);
        let merged = merge_env(&synced, &local, &["DB_SOCKET".to_string()]);
        assert_eq!(merged["LOCAL_GPU"], "a100");
        assert_eq!(merged["DB_SOCKET"], "/var/run/db");
    }

    #[test]
    fn machine_local_key_absent_locally_takes_synced() {
        let synced = map(&[("LOCAL_GPU", "none")]);
        let local = map(&[]);
        let merged = merge_env(&synced, &local, &[]);
        assert_eq!(merged["LOCAL_GPU"], "none");
    }

    #[test]
    fn render_is_sorted_and_parseable() {
        let merged = merge_env(&map(&[("B", "2"), ("A", "1")]), &map(&[]), &[]);
        let rendered = render_env(&merged);
        assert_eq!(rendered, "A=1\nB=2\n");
        let parsed = parse_env(&rendered);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["B"], "2");
    }

    #[test]
    fn parse_ignores_comments_and_blanks() {
        let parsed = parse_env("# secrets\n\nKEY=value\nBROKEN_LINE\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["KEY"], "value");
    }
}
