use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Bot API base URL (e.g. `https://api.telegram.org`)
    pub bot_api_url: String,
    pub bot_token: String,
    /// Group chat the bot operates in; task topics are created here
    pub chat_group_id: i64,

    /// PostgreSQL connection URL
    pub database_url: String,
    #[serde(default = "default_database_pool_size")]
    pub database_pool_size: u32,

    /// Activates the task executor loop on this process
    #[serde(default)]
    pub executor_enabled: bool,
    /// Worker id stamped on claimed tasks
    #[serde(default = "default_executor_id")]
    pub executor_id: String,
    #[serde(default = "default_executor_max_concurrent")]
    pub executor_max_concurrent: usize,
    /// CSV of machine ids this worker executes on; empty = all SSH targets
    #[serde(default)]
    pub executor_targets: String,

    /// `stream-json` or `tui`
    #[serde(default = "default_session_mode")]
    pub session_mode: String,

    /// SSH targets: machine id -> `user@host[:port]`
    #[serde(default)]
    pub targets: HashMap<String, String>,
    /// Machine ids whose remote shell is PowerShell
    #[serde(default)]
    pub windows_targets: Vec<String>,
    /// SSH private key content (preferred for containerized deployments)
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: String,
    #[serde(default = "default_ssh_timeout_secs")]
    pub ssh_timeout_secs: u64,

    /// Default engine when a task carries no model hint
    #[serde(default = "default_engine")]
    pub default_engine: String,

    /// Base path on targets where persistent clones live
    #[serde(default = "default_repos_base_path")]
    pub repos_base_path: String,
    /// Base path on targets where per-task worktrees are created
    #[serde(default = "default_workspaces_path")]
    pub workspaces_path: String,
    /// Default GitHub org for repo discovery and creation
    #[serde(default)]
    pub default_org: Option<String>,
    /// Static project -> repo URL mapping, consulted before host discovery
    #[serde(default)]
    pub projects: HashMap<String, String>,

    /// Passphrase for the encrypted env sync store (unset = no env sync)
    #[serde(default)]
    pub env_sync_passphrase: Option<String>,
    /// Keys that win locally over the synced value
    #[serde(default)]
    pub machine_local_keys: Vec<String>,

    /// Wall clock for interactive sessions
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Wall clock for task runs
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// File the update poller persists its offset to
    #[serde(default = "default_offset_path")]
    pub update_offset_path: String,
}

fn default_database_pool_size() -> u32 { 5 }
fn default_executor_id() -> String { "worker-1".into() }
fn default_executor_max_concurrent() -> usize { 3 }
fn default_session_mode() -> String { "stream-json".into() }
fn default_ssh_key_path() -> String { "/secrets/ssh/id_ed25519".into() }
fn default_ssh_timeout_secs() -> u64 { 30 }
fn default_engine() -> String { "claude".into() }
fn default_repos_base_path() -> String { "/home/agent/repos".into() }
fn default_workspaces_path() -> String { "/home/agent/workspaces".into() }
fn default_session_timeout_secs() -> u64 { 600 }
fn default_task_timeout_secs() -> u64 { 1800 }
fn default_listen_addr() -> String { "0.0.0.0:8000".into() }
fn default_offset_path() -> String { "/var/lib/orchestrator/update-offset".into() }

impl Settings {
    /// Machine ids this worker executes on. Falls back to every configured
    /// SSH target when `EXECUTOR_TARGETS` is unset.
    pub fn managed_machines(&self) -> Vec<String> {
        let csv: Vec<String> = self
            .executor_targets
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if csv.is_empty() {
            let mut all: Vec<String> = self.targets.keys().cloned().collect();
            all.sort();
            all
        } else {
            csv
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .expect("Failed to build config")
            .try_deserialize()
            .expect("Failed to deserialize config")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Settings {
        Settings {
            bot_api_url: "https://api.example.org".into(),
            bot_token: "t".into(),
            chat_group_id: -100,
            database_url: "postgres://localhost/x".into(),
            database_pool_size: default_database_pool_size(),
            executor_enabled: true,
            executor_id: default_executor_id(),
            executor_max_concurrent: default_executor_max_concurrent(),
            executor_targets: String::new(),
            session_mode: default_session_mode(),
            targets: HashMap::new(),
            windows_targets: vec![],
            ssh_key: None,
            ssh_key_path: default_ssh_key_path(),
            ssh_timeout_secs: default_ssh_timeout_secs(),
            default_engine: default_engine(),
            repos_base_path: default_repos_base_path(),
            workspaces_path: default_workspaces_path(),
            default_org: None,
            projects: HashMap::new(),
            env_sync_passphrase: None,
            machine_local_keys: vec![],
            session_timeout_secs: default_session_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            listen_addr: default_listen_addr(),
            update_offset_path: default_offset_path(),
        }
    }

    #[test]
    fn managed_machines_from_csv() {
        let mut s = minimal();
        s.executor_targets = "alpha, beta ,".into();
        assert_eq!(s.managed_machines(), vec!["alpha", "beta"]);
    }

    #[test]
    fn managed_machines_falls_back_to_targets() {
        let mut s = minimal();
        s.targets.insert("zeta".into(), "agent@zeta".into());
        s.targets.insert("alpha".into(), "agent@alpha".into());
        assert_eq!(s.managed_machines(), vec!["alpha", "zeta"]);
    }
}
