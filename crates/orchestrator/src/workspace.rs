use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use common::fmt::truncate_chars;
use common::OrcError;
use regex::Regex;
use shell_escape::escape;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::config::settings;
use crate::database::TaskRow;
use crate::shell::ShellGateway;

fn shell_quote(s: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(s))
}

static PR_URL_RE: OnceLock<Regex> = OnceLock::new();

fn pr_url_re() -> &'static Regex {
    PR_URL_RE.get_or_init(|| Regex::new(r"https://\S+/pull/\d+").expect("invalid PR url regex"))
}

/// First pull-request URL in a command's output, if any.
pub fn parse_pr_url(output: &str) -> Option<String> {
    pr_url_re().find(output).map(|m| m.as_str().to_string())
}

/// Commit message for the auto-commit after a task run.
pub fn commit_message(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("").trim();
    format!("feat: {}", truncate_chars(first_line, 72))
}

pub fn branch_name(short_id: &str) -> String {
    format!("task/{}", short_id)
}

/// Repo hosting API, driven through the `gh` CLI on the worker machine.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Look up the clone URL for a project, if the host knows it.
    async fn repo_url(&self, machine: &str, project: &str) -> Result<Option<String>>;
    /// Create a private repository and return its clone URL.
    async fn create_repo(&self, machine: &str, name: &str) -> Result<String>;
}

pub struct GhCliHost {
    shell: Arc<ShellGateway>,
    default_org: Option<String>,
}

impl GhCliHost {
    pub fn new(shell: Arc<ShellGateway>, default_org: Option<String>) -> Self {
        Self { shell, default_org }
    }

    fn qualified(&self, name: &str) -> String {
        if name.contains('/') {
            name.to_string()
        } else if let Some(org) = &self.default_org {
            format!("{}/{}", org, name)
        } else {
            name.to_string()
        }
    }
}

#[async_trait]
impl RepoHost for GhCliHost {
    async fn repo_url(&self, machine: &str, project: &str) -> Result<Option<String>> {
        let cmd = format!(
            "gh repo view {} --json url --jq .url",
            shell_quote(&self.qualified(project))
        );
        let out = self.shell.exec(machine, &cmd).await?;
        if out.success {
            let url = out.stdout.trim();
            if !url.is_empty() {
                return Ok(Some(url.to_string()));
            }
        }
        Ok(None)
    }

    async fn create_repo(&self, machine: &str, name: &str) -> Result<String> {
        let qualified = self.qualified(name);
        let cmd = format!("gh repo create {} --private", shell_quote(&qualified));
        let out = self.shell.exec(machine, &cmd).await?;
        if !out.success {
            return Err(anyhow::anyhow!(
                "gh repo create failed: {}",
                out.stderr.trim()
            ));
        }
        // gh prints the repo URL on success; fall back to the conventional one
        let url = out
            .stdout
            .lines()
            .find(|l| l.starts_with("https://"))
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("https://github.com/{}", qualified));
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub base_path: String,
    pub workspace_path: String,
    pub branch: String,
    pub base_ref: String,
}

#[derive(Debug, Clone, Default)]
pub struct PostRunResult {
    pub committed: bool,
    pub pushed: bool,
    pub pr_url: Option<String>,
    pub files_changed: Vec<String>,
}

/// Prepares per-task worktrees next to persistent base clones and drives
/// the post-completion commit/push/PR steps, all over the shell gateway.
pub struct WorkspaceManager {
    shell: Arc<ShellGateway>,
}

impl WorkspaceManager {
    pub fn new(shell: Arc<ShellGateway>) -> Self {
        Self { shell }
    }

    fn base_path(&self, project: &str) -> String {
        format!("{}/{}", settings().repos_base_path, project)
    }

    fn workspace_path(&self, project: &str, short_id: &str) -> String {
        format!("{}/{}-{}", settings().workspaces_path, project, short_id)
    }

    /// Resolve a task's repo URL: explicit field, static config, a local
    /// clone already on the machine, then the host API. `NoRepo` when all
    /// of those come up empty.
    pub async fn resolve_repo_url(
        &self,
        machine: &str,
        task: &TaskRow,
        host: &dyn RepoHost,
    ) -> Result<String, OrcError> {
        if let Some(url) = &task.repo_url
            && !url.trim().is_empty()
        {
            return Ok(url.clone());
        }

        if let Some(url) = settings().projects.get(&task.project) {
            return Ok(url.clone());
        }

        // A clone that already exists on the machine knows its own origin
        let probe = format!(
            "git -C {} remote get-url origin",
            shell_quote(&self.base_path(&task.project))
        );
        if let Ok(out) = self.shell.exec(machine, &probe).await
            && out.success
        {
            let url = out.stdout.trim();
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }

        match host.repo_url(machine, &task.project).await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(OrcError::no_repo(format!(
                "no repository found for project {}",
                task.project
            ))),
            Err(e) => Err(OrcError::no_repo(format!(
                "repository lookup for {} failed: {}",
                task.project, e
            ))),
        }
    }

    async fn run(&self, machine: &str, cmd: &str) -> Result<String, OrcError> {
        match self.shell.exec(machine, cmd).await {
            Ok(out) if out.success => Ok(out.stdout),
            Ok(out) => Err(OrcError::fatal(truncate_chars(
                &format!("`{}` failed: {}", cmd, out.stderr.trim()),
                2000,
            ).to_string())),
            Err(e) => Err(OrcError::fatal(truncate_chars(
                &format!("`{}` errored: {}", cmd, e),
                2000,
            ).to_string())),
        }
    }

    /// Pick the base ref: the requested branch if origin has it, else
    /// `main`, else `master`.
    async fn resolve_base_ref(
        &self,
        machine: &str,
        base_path: &str,
        requested: Option<&str>,
    ) -> Result<String, OrcError> {
        let mut candidates: Vec<&str> = Vec::new();
        if let Some(branch) = requested
            && !branch.trim().is_empty()
        {
            candidates.push(branch.trim());
        }
        candidates.push("main");
        candidates.push("master");

        for candidate in candidates {
            let check = format!(
                "git -C {} rev-parse --verify --quiet origin/{}",
                shell_quote(base_path),
                shell_quote(candidate)
            );
            if let Ok(out) = self.shell.exec(machine, &check).await
                && out.success
            {
                return Ok(candidate.to_string());
            }
        }
        Err(OrcError::fatal(format!(
            "no usable base branch on origin for {}",
            base_path
        )))
    }

    /// Ensure the base clone, fetch, and create the per-task worktree on a
    /// fresh `task/<shortid>` branch.
    pub async fn prepare(
        &self,
        machine: &str,
        project: &str,
        repo_url: &str,
        source_branch: Option<&str>,
        short_id: &str,
    ) -> Result<PreparedWorkspace, OrcError> {
        let base = self.base_path(project);
        let workspace = self.workspace_path(project, short_id);
        let branch = branch_name(short_id);

        self.run(
            machine,
            &format!(
                "mkdir -p {} {}",
                shell_quote(settings().repos_base_path.as_str()),
                shell_quote(settings().workspaces_path.as_str())
            ),
        )
        .await?;

        // Persistent base clone, created once then fetched forever
        let ensure_clone = format!(
            "test -d {base}/.git || git clone {url} {base}",
            base = shell_quote(&base),
            url = shell_quote(repo_url)
        );
        self.run(machine, &ensure_clone).await?;

        self.run(
            machine,
            &format!("git -C {} fetch --all --prune", shell_quote(&base)),
        )
        .await?;

        let base_ref = self.resolve_base_ref(machine, &base, source_branch).await?;

        let add_worktree = format!(
            "git -C {} worktree add -b {} {} origin/{}",
            shell_quote(&base),
            shell_quote(&branch),
            shell_quote(&workspace),
            shell_quote(&base_ref)
        );
        self.run(machine, &add_worktree).await?;

        // Running as root: hand the worktree to the CLI user so the engine
        // can write to it
        let target_user = self.shell.target(machine).map(|t| t.user.clone());
        if let Ok(user) = target_user
            && user == "root"
            && let Some(cli_user) = home_user(&settings().workspaces_path)
        {
            let chown = format!(
                "chown -R {}: {}",
                shell_quote(&cli_user),
                shell_quote(&workspace)
            );
            if let Err(e) = self.run(machine, &chown).await {
                tracing::warn!(machine, error = %e, "Failed to chown worktree");
            }
        }

        Ok(PreparedWorkspace {
            base_path: base,
            workspace_path: workspace,
            branch,
            base_ref,
        })
    }

    /// Materialize a `.env` file into the workspace from merged sync
    /// content. Base64 transport avoids quoting the values through the
    /// remote shell.
    pub async fn write_env_file(
        &self,
        machine: &str,
        workspace: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), OrcError> {
        if env.is_empty() {
            return Ok(());
        }
        let content = crate::envsync::render_env(env);
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let cmd = format!(
            "printf %s {} | base64 -d > {}/.env",
            shell_quote(&encoded),
            shell_quote(workspace)
        );
        self.run(machine, &cmd).await?;
        Ok(())
    }

    /// Read the workspace's `.env` (empty when the checkout has none).
    pub async fn read_env_file(
        &self,
        machine: &str,
        workspace: &str,
    ) -> Result<String, OrcError> {
        let cmd = format!("cat {}/.env 2>/dev/null || true", shell_quote(workspace));
        self.run(machine, &cmd).await
    }

    /// Upload the assembled prompt to a per-task path on the remote.
    pub async fn write_prompt_file(
        &self,
        machine: &str,
        task_id: &str,
        prompt: &str,
    ) -> Result<String, OrcError> {
        let path = format!("/tmp/task-{}.prompt", task_id);
        let encoded = base64::engine::general_purpose::STANDARD.encode(prompt);
        let cmd = format!(
            "printf %s {} | base64 -d > {}",
            shell_quote(&encoded),
            shell_quote(&path)
        );
        self.run(machine, &cmd).await?;
        Ok(path)
    }

    /// Post-completion: commit anything dirty, push the branch, try to
    /// open a PR, and compute the changed-file list. Runs regardless of
    /// the session's exit code; partial work is still pushed for review.
    pub async fn post_completion(
        &self,
        machine: &str,
        workspace: &str,
        description: &str,
    ) -> PostRunResult {
        let mut result = PostRunResult::default();
        let ws = shell_quote(workspace).into_owned();

        let dirty = match self
            .shell
            .exec(machine, &format!("git -C {} status --porcelain", ws))
            .await
        {
            Ok(out) if out.success => !out.stdout.trim().is_empty(),
            _ => false,
        };

        if dirty {
            let commit = format!(
                "git -C {ws} add -A && git -C {ws} commit -m {msg}",
                ws = ws,
                msg = shell_quote(&commit_message(description))
            );
            match self.shell.exec(machine, &commit).await {
                Ok(out) if out.success => result.committed = true,
                Ok(out) => {
                    tracing::warn!(machine, stderr = %out.stderr.trim(), "Auto-commit failed")
                }
                Err(e) => tracing::warn!(machine, error = %e, "Auto-commit errored"),
            }
        }

        match self
            .shell
            .exec(machine, &format!("git -C {} push -u origin HEAD", ws))
            .await
        {
            Ok(out) if out.success => result.pushed = true,
            Ok(out) => tracing::warn!(machine, stderr = %out.stderr.trim(), "Push failed"),
            Err(e) => tracing::warn!(machine, error = %e, "Push errored"),
        }

        if result.pushed {
            let pr_cmd = format!("cd {} && gh pr create --fill 2>&1", ws);
            if let Ok(out) = self.shell.exec(machine, &pr_cmd).await {
                result.pr_url = parse_pr_url(&out.stdout).or_else(|| parse_pr_url(&out.stderr));
            }
        }

        // Changed files: the commit we just made, or whatever is dirty
        let diff_cmd = if result.committed {
            format!("git -C {} diff --name-only HEAD~1..HEAD", ws)
        } else {
            format!("git -C {} status --porcelain", ws)
        };
        if let Ok(out) = self.shell.exec(machine, &diff_cmd).await
            && out.success
        {
            result.files_changed = out
                .stdout
                .lines()
                .map(|l| {
                    if result.committed {
                        l.trim().to_string()
                    } else {
                        // porcelain lines are "XY path"
                        l.get(3..).unwrap_or(l).trim().to_string()
                    }
                })
                .filter(|l| !l.is_empty())
                .collect();
        }

        result
    }
}

/// Infer the CLI user from a home-rooted path like `/home/agent/workspaces`.
fn home_user(path: &str) -> Option<String> {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some("home"), Some(user)) => Some(user.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_url_first_match_wins() {
        let out = "Creating pull request...\nhttps://github.com/x/foo/pull/7\nhttps://github.com/x/foo/pull/8\n";
        assert_eq!(
            parse_pr_url(out),
            Some("https://github.com/x/foo/pull/7".to_string())
        );
        assert_eq!(parse_pr_url("no url here"), None);
    }

    #[test]
    fn commit_message_truncates_at_72() {
        let short = commit_message("add readme");
        assert_eq!(short, "feat: add readme");

        let long = "a".repeat(100);
        let msg = commit_message(&long);
        assert_eq!(msg.len(), "feat: ".len() + 72);
    }

    #[test]
    fn commit_message_uses_first_line() {
        assert_eq!(
            commit_message("fix the pager\n\nlong body here"),
            "feat: fix the pager"
        );
    }

    #[test]
    fn branch_names() {
        assert_eq!(branch_name("a1b2c3d4"), "task/a1b2c3d4");
    }

    #[test]
    fn home_user_extraction() {
        assert_eq!(home_user("/home/agent/workspaces"), Some("agent".into()));
        assert_eq!(home_user("/srv/workspaces"), None);
        assert_eq!(home_user(""), None);
    }
}
