use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::settings;

/// One-shot command output is capped here so a runaway remote command
/// cannot exhaust memory.
const EXEC_OUTPUT_CAP: usize = 1024 * 1024;
/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Path to the SSH key file (either configured or written from env content)
static SSH_KEY_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the SSH key once at startup. When `SSH_KEY` carries the key
/// content (containerized deployments), it is written to a runtime file
/// with owner-only permissions.
pub fn init_ssh_key() -> Result<()> {
    let path = create_ssh_key_path()?;
    let _ = SSH_KEY_PATH.set(path);
    Ok(())
}

fn create_ssh_key_path() -> Result<PathBuf> {
    let s = settings();

    if let Some(key_content) = &s.ssh_key {
        let key_path = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir())
            .join("orchestrator-ssh-key");

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            file.write_all(key_content.as_bytes())?;
            if !key_content.ends_with('\n') {
                file.write_all(b"\n")?;
            }
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, key_content)?;
        }

        tracing::info!("SSH key written to runtime file");
        Ok(key_path)
    } else {
        Ok(PathBuf::from(&s.ssh_key_path))
    }
}

fn ssh_key_path() -> Result<&'static PathBuf> {
    SSH_KEY_PATH
        .get()
        .ok_or_else(|| anyhow!("SSH key not initialized - call init_ssh_key() first"))
}

/// A remote host the gateway can run commands on.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub id: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub windows: bool,
}

impl SshTarget {
    /// Parse a `user@host[:port]` target entry.
    pub fn parse(id: &str, entry: &str, windows: bool) -> Result<Self> {
        let (user, rest) = entry
            .split_once('@')
            .ok_or_else(|| anyhow!("target {} must be user@host[:port], got {}", id, entry))?;
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| anyhow!("target {} has invalid port {}", id, port))?,
            ),
            None => (rest, 22),
        };
        if user.is_empty() || host.is_empty() {
            return Err(anyhow!("target {} must be user@host[:port]", id));
        }
        Ok(Self {
            id: id.to_string(),
            user: user.to_string(),
            host: host.to_string(),
            port,
            windows,
        })
    }
}

/// Adapt a command for the target's remote shell. Windows shells reject
/// `&&`, so it becomes a statement separator and the whole command is run
/// through PowerShell; POSIX targets get an explicit PATH export because
/// the remote shell is non-login.
pub fn adapt_command(cmd: &str, windows: bool) -> String {
    if windows {
        let statements = cmd.replace(" && ", " ; ");
        format!(
            "powershell -NoProfile -Command \"{}\"",
            statements.replace('"', "`\"")
        )
    } else {
        format!(
            "export PATH=\"$HOME/.local/bin:$HOME/.npm-global/bin:/usr/local/bin:$PATH\"; {}",
            cmd
        )
    }
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

/// Stream events from a spawned remote process. `Exit` is sent only after
/// both stdio readers have drained, so fast-failing commands never lose
/// output.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(i32),
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Force a PTY on the remote side (TUI engines need one). Never
    /// honored on Windows targets.
    pub use_pty: bool,
    /// Close stdin right after spawn (batch commands reading a pipe).
    pub close_stdin: bool,
    /// Upper bound on the process lifetime; `kill()` fires when it lapses.
    pub timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            use_pty: false,
            close_stdin: false,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Write/kill handle for a spawned remote process. Cloneable; all clones
/// address the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    stdin_tx: mpsc::Sender<Vec<u8>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.stdin_tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| anyhow!("process stdin closed"))
    }

    /// Request termination: SIGTERM, SIGKILL after a short grace window.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

fn send_signal(pid: u32, signum: i32) {
    #[cfg(unix)]
    // SAFETY: kill() is async-signal-safe; pid came from a live child.
    unsafe {
        libc::kill(pid as i32, signum);
    }
    #[cfg(not(unix))]
    let _ = (pid, signum);
}

fn truncate_output(mut bytes: Vec<u8>) -> String {
    if bytes.len() > EXEC_OUTPUT_CAP {
        bytes.truncate(EXEC_OUTPUT_CAP);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Spawns and supervises remote processes over SSH, one child per command.
pub struct ShellGateway {
    targets: HashMap<String, SshTarget>,
    handles: Arc<DashMap<u64, ProcessHandle>>,
    next_id: AtomicU64,
}

impl ShellGateway {
    pub fn from_settings() -> Result<Self> {
        let s = settings();
        let mut targets = HashMap::new();
        for (id, entry) in &s.targets {
            let windows = s.windows_targets.iter().any(|w| w == id);
            targets.insert(id.clone(), SshTarget::parse(id, entry, windows)?);
        }
        Ok(Self {
            targets,
            handles: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    #[cfg(test)]
    pub fn with_targets(targets: Vec<SshTarget>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            handles: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn target(&self, machine_id: &str) -> Result<&SshTarget> {
        self.targets
            .get(machine_id)
            .ok_or_else(|| anyhow!("unknown target: {}", machine_id))
    }

    pub fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.targets.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn ssh_command(&self, target: &SshTarget, pty: bool) -> Result<Command> {
        let key_path = ssh_key_path()?;
        let mut cmd = Command::new("ssh");
        if pty && !target.windows {
            cmd.arg("-tt");
        }
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-i")
            .arg(key_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg(format!("{}@{}", target.user, target.host));
        Ok(cmd)
    }

    /// Run one command to completion with the default timeout.
    pub async fn exec(&self, machine_id: &str, cmd: &str) -> Result<ExecOutcome> {
        let timeout = Duration::from_secs(settings().ssh_timeout_secs);
        self.exec_with_timeout(machine_id, cmd, timeout).await
    }

    pub async fn exec_with_timeout(
        &self,
        machine_id: &str,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        let target = self.target(machine_id)?;
        let remote = adapt_command(cmd, target.windows);

        let output_future = self.ssh_command(target, false)?.arg(remote).output();
        let output = tokio::time::timeout(timeout, output_future)
            .await
            .map_err(|_| anyhow!("command on {} timed out after {:?}", machine_id, timeout))??;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ExecOutcome {
            stdout: truncate_output(output.stdout),
            stderr: truncate_output(output.stderr),
            exit_code,
            success: output.status.success(),
        })
    }

    /// Spawn an interactive remote process. Events arrive on `events`;
    /// the returned handle writes to stdin and kills.
    pub async fn spawn(
        &self,
        machine_id: &str,
        cmd: &str,
        opts: SpawnOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Result<ProcessHandle> {
        let target = self.target(machine_id)?;
        let remote = adapt_command(cmd, target.windows);

        let mut child = self
            .ssh_command(target, opts.use_pty)?
            .arg(remote)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout pipe"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr pipe"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let kill = CancellationToken::new();
        let handle = ProcessHandle {
            stdin_tx,
            kill: kill.clone(),
        };

        let handle_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(handle_id, handle.clone());

        // Stdin writer: forwards queued writes; EOF when the last sender
        // drops or close_stdin was requested.
        let close_stdin = opts.close_stdin;
        tokio::spawn(async move {
            if close_stdin {
                let _ = stdin.shutdown().await;
                return;
            }
            while let Some(bytes) = stdin_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            let _ = stdin.shutdown().await;
        });

        let stdout_task = spawn_reader(stdout, events.clone(), ProcessEvent::Stdout);
        let stderr_task = spawn_reader(stderr, events.clone(), ProcessEvent::Stderr);

        // Watchdog: SIGTERM on kill() or timeout, SIGKILL after the grace
        // window. Aborted on natural exit.
        let pid = child.id();
        let watchdog = tokio::spawn({
            let kill = kill.clone();
            let timeout = opts.timeout;
            async move {
                tokio::select! {
                    _ = kill.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(pid = ?pid, "Process hit its time bound, terminating");
                    }
                }
                if let Some(pid) = pid {
                    send_signal(pid, SIGTERM);
                    tokio::time::sleep(KILL_GRACE).await;
                    send_signal(pid, SIGKILL);
                }
            }
        });

        // Supervisor: wait for exit, drain both readers, then emit Exit and
        // drop the handle entry unconditionally.
        let machine = machine_id.to_string();
        let handles = Arc::clone(&self.handles);
        tokio::spawn(async move {
            let status = child.wait().await;
            watchdog.abort();

            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let code = match status {
                Ok(s) => s.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(machine = %machine, error = %e, "Failed to wait for remote process");
                    -1
                }
            };
            let _ = events.send(ProcessEvent::Exit(code)).await;
            handles.remove(&handle_id);
        });

        Ok(handle)
    }

    /// Number of live process handles (diagnostics).
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }
}

fn spawn_reader<R>(
    mut reader: R,
    events: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if events.send(wrap(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_with_port() {
        let t = SshTarget::parse("alpha", "agent@alpha.local:2222", false).unwrap();
        assert_eq!(t.user, "agent");
        assert_eq!(t.host, "alpha.local");
        assert_eq!(t.port, 2222);
        assert!(!t.windows);
    }

    #[test]
    fn parse_target_default_port() {
        let t = SshTarget::parse("beta", "agent@beta", true).unwrap();
        assert_eq!(t.port, 22);
        assert!(t.windows);
    }

    #[test]
    fn parse_target_rejects_garbage() {
        assert!(SshTarget::parse("x", "no-user-part", false).is_err());
        assert!(SshTarget::parse("x", "agent@host:notaport", false).is_err());
        assert!(SshTarget::parse("x", "@host", false).is_err());
    }

    #[test]
    fn posix_commands_get_path_export() {
        let adapted = adapt_command("git status && git push", false);
        assert!(adapted.starts_with("export PATH="));
        assert!(adapted.ends_with("git status && git push"));
    }

    #[test]
    fn windows_commands_lose_double_ampersand() {
        let adapted = adapt_command("cd repo && git status", true);
        assert!(adapted.starts_with("powershell -NoProfile -Command"));
        assert!(!adapted.contains("&&"));
        assert!(adapted.contains("cd repo ; git status"));
    }

    #[test]
    fn windows_quotes_are_escaped() {
        let adapted = adapt_command(r#"echo "hi""#, true);
        assert!(adapted.contains("`\"hi`\""));
    }

    #[test]
    fn unknown_target_fails_before_spawn() {
        let gw = ShellGateway::with_targets(vec![]);
        assert!(gw.target("ghost").is_err());
    }

    #[test]
    fn output_cap_truncates() {
        let big = vec![b'x'; EXEC_OUTPUT_CAP + 500];
        assert_eq!(truncate_output(big).len(), EXEC_OUTPUT_CAP);
    }
}
