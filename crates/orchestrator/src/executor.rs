use common::fmt::truncate_chars;
use common::{ErrorKind, OrcError};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use chat_client::InlineKeyboard;
use common::CallbackData;

use crate::chat::TopicFacade;
use crate::config::settings;
use crate::database::{Database, MachineRow, TaskCompletion, TaskRow, TaskStatus};
use crate::engine::Engine;
use crate::envsync::{merge_env, parse_env, EnvSync};
use crate::machines::{MachineRegistry, HEARTBEAT_INTERVAL_SECS};
use crate::prompt::{assemble_prompt, MemoryStore, MEMORY_TOP_K};
use crate::session::{SessionRequest, SessionSupervisor};
use crate::shell::ShellGateway;
use crate::state::{SessionMode, SharedState};
use crate::workspace::{RepoHost, WorkspaceManager};

/// Claim-loop cadence.
const POLL: Duration = Duration::from_secs(5);
/// How long the no-repo prompt waits for a human decision.
const NO_REPO_WAIT: Duration = Duration::from_secs(5 * 60);
const NO_REPO_POLL: Duration = Duration::from_secs(5);
/// Result summaries keep this much transcript.
const SUMMARY_KEEP: usize = 4000;

/// Per-worker task executor: claims queued tasks for its managed machines,
/// prepares workspaces, drives sessions, and persists outcomes.
pub struct TaskExecutor {
    db: Database,
    facade: Arc<TopicFacade>,
    registry: MachineRegistry,
    supervisor: Arc<SessionSupervisor>,
    state: Arc<SharedState>,
    workspaces: WorkspaceManager,
    env_sync: Arc<dyn EnvSync>,
    repo_host: Arc<dyn RepoHost>,
    memory: Option<Arc<dyn MemoryStore>>,
    /// task id -> machine id, owned by the claim/exit paths
    active: DashMap<String, String>,
    managed: Vec<String>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        shell: Arc<ShellGateway>,
        facade: Arc<TopicFacade>,
        registry: MachineRegistry,
        supervisor: Arc<SessionSupervisor>,
        state: Arc<SharedState>,
        env_sync: Arc<dyn EnvSync>,
        repo_host: Arc<dyn RepoHost>,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> Self {
        let managed = settings().managed_machines();
        Self {
            db,
            facade,
            registry,
            supervisor,
            state,
            workspaces: WorkspaceManager::new(shell),
            env_sync,
            repo_host,
            memory,
            active: DashMap::new(),
            managed,
        }
    }

    pub fn managed_machines(&self) -> &[String] {
        &self.managed
    }

    fn active_on(&self, machine: &str) -> i32 {
        self.active.iter().filter(|e| e.value() == machine).count() as i32
    }

    /// Register managed machines in the registry so the rest of the fleet
    /// can route to them.
    pub async fn register_machines(&self) {
        let s = settings();
        for machine_id in &self.managed {
            let os = if s.windows_targets.iter().any(|w| w == machine_id) {
                "windows"
            } else {
                "linux"
            };
            let row = MachineRow {
                machine_id: machine_id.clone(),
                display_name: machine_id.clone(),
                projects: s.projects.keys().cloned().collect(),
                max_concurrent: s.executor_max_concurrent as i32,
                active_tasks: 0,
                os: os.to_string(),
                engine_priority: vec!["claude".into(), "codex".into(), "gemini".into()],
                health_url: None,
                last_heartbeat: chrono::Utc::now(),
                status: "online".into(),
            };
            if let Err(e) = self.registry.register(&row).await {
                tracing::warn!(machine = %machine_id, error = %e, "Failed to register machine");
            }
        }
    }

    /// Fail any task this worker's machines left behind in a previous life.
    pub async fn recover_stale_tasks(&self) {
        for machine_id in &self.managed {
            match self.db.fail_stale_tasks(machine_id).await {
                Ok(count) if count > 0 => {
                    tracing::warn!(machine = %machine_id, count, "Recovered stale tasks from crashed run");
                    counter!("tasks_recovered_total").increment(count);
                }
                Err(e) => {
                    tracing::warn!(machine = %machine_id, error = %e, "Stale task recovery failed");
                }
                _ => {}
            }
        }
    }

    /// Close topics the registry still marks active but whose task already
    /// finished (or never existed). Runs at startup so a crash between
    /// task completion and topic close cannot orphan a thread.
    pub async fn recover_orphaned_topics(&self) {
        let topics = match self.db.list_topics_by_status("active").await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "Orphaned-topic scan failed");
                return;
            }
        };
        for topic in topics {
            let orphaned = match &topic.task_id {
                Some(task_id) => match self.db.get_task(task_id).await {
                    Ok(Some(task)) => task.status().map(|s| s.is_terminal()).unwrap_or(true),
                    Ok(None) => true,
                    Err(_) => false,
                },
                // Session topics have no task row; the session died with
                // the previous process
                None => self.state.session_by_thread(topic.thread_id).is_none(),
            };
            if orphaned {
                tracing::info!(thread_id = topic.thread_id, "Closing orphaned topic");
                self.facade.close_topic(topic.thread_id).await;
            }
        }
    }

    /// Heartbeat loop: every 30 s refresh each managed machine's row with
    /// its current load.
    pub async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for machine_id in &self.managed {
                        let active = self.active_on(machine_id);
                        if let Err(e) = self.registry.heartbeat(machine_id, active).await {
                            tracing::warn!(machine = %machine_id, error = %e, "Machine heartbeat failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Machine heartbeat loop cancelled");
                    break;
                }
            }
        }
    }

    /// The claim loop. Each tick, while below the concurrency cap, try to
    /// claim one task per managed machine and run it in the background.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let worker_id = settings().executor_id.clone();
        let max_concurrent = settings().executor_max_concurrent;
        let mut interval = tokio::time::interval(POLL);

        tracing::info!(
            worker_id = %worker_id,
            machines = ?self.managed,
            max_concurrent,
            "Task executor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for machine_id in self.managed.clone() {
                        if self.active.len() >= max_concurrent {
                            break;
                        }
                        match self.db.claim_next_task(&worker_id, &machine_id).await {
                            Ok(Some(task)) => {
                                counter!("tasks_claimed_total").increment(1);
                                gauge!("active_tasks").increment(1.0);
                                self.active.insert(task.id.clone(), machine_id.clone());

                                let executor = Arc::clone(&self);
                                let machine = machine_id.clone();
                                tokio::spawn(async move {
                                    let task_id = task.id.clone();
                                    executor.run_task(task, &machine).await;
                                    executor.active.remove(&task_id);
                                    gauge!("active_tasks").decrement(1.0);
                                });
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(machine = %machine_id, error = %e, "Claim query failed");
                            }
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Task executor cancelled");
                    break;
                }
            }
        }
    }

    /// Cancel a task: flip the row and kill the live session if this
    /// worker owns it.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self.db.cancel_task(task_id).await {
            Ok(Some(task)) => {
                for session in self.state.active_sessions.iter() {
                    if session.task_id.as_deref() == Some(task_id) {
                        if let Some(handle) = &session.handle {
                            handle.kill();
                        }
                    }
                }
                if let Some(thread_id) = task.thread_id {
                    let _ = self.facade.send(Some(thread_id), "Task cancelled.").await;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Cancel failed");
                false
            }
        }
    }

    async fn run_task(&self, task: TaskRow, machine: &str) {
        let started = Instant::now();
        let short = task.short_id().to_string();
        tracing::info!(task_id = %task.id, machine, project = %task.project, "Running task");

        // Thread first: every later failure is reported there. A failure
        // to create the topic itself goes to the main chat so the user is
        // never silently stuck.
        let thread_id = match task.thread_id {
            Some(t) => t,
            None => {
                let title = format!("{} · {}", short, truncate_chars(&task.description, 48));
                match self.facade.create_topic(&title, Some(&task.id)).await {
                    Ok(t) => {
                        let _ = self.db.set_task_thread(&task.id, t).await;
                        t
                    }
                    Err(e) => {
                        let msg = format!("Task {}: could not create its topic: {}", short, e);
                        let _ = self.facade.send(None, &msg).await;
                        self.persist_failure(&task, None, &msg).await;
                        return;
                    }
                }
            }
        };

        let repo_url = match self
            .workspaces
            .resolve_repo_url(machine, &task, &*self.repo_host)
            .await
        {
            Ok(url) => url,
            Err(e) if e.kind() == ErrorKind::NoRepo => {
                match self.no_repo_flow(&task, thread_id, machine).await {
                    Ok(url) => url,
                    Err(e) => {
                        self.persist_failure(&task, Some(thread_id), e.message()).await;
                        return;
                    }
                }
            }
            Err(e) => {
                self.persist_failure(&task, Some(thread_id), e.message()).await;
                return;
            }
        };

        let workspace = match self
            .workspaces
            .prepare(
                machine,
                &task.project,
                &repo_url,
                task.source_branch.as_deref(),
                &short,
            )
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                self.persist_failure(&task, Some(thread_id), e.message()).await;
                return;
            }
        };
        let _ = self.db.set_task_workspace(&task.id, &workspace.workspace_path).await;

        self.materialize_env(&task, machine, &workspace.workspace_path).await;

        let (memory_hits, project_rules) = self.memory_context(&task).await;
        let prompt = match assemble_prompt(&task.project, &task.description, &memory_hits, &project_rules)
        {
            Ok(p) => p,
            Err(e) => {
                self.persist_failure(&task, Some(thread_id), e.message()).await;
                return;
            }
        };

        let prompt_path = match self
            .workspaces
            .write_prompt_file(machine, &task.id, &prompt)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.persist_failure(&task, Some(thread_id), e.message()).await;
                return;
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let _ = self.db.set_task_session(&task.id, &session_id).await;
        let _ = self.db.set_task_status(&task.id, TaskStatus::Running).await;

        let request = SessionRequest {
            session_id,
            machine: machine.to_string(),
            workdir: workspace.workspace_path.clone(),
            prompt,
            prompt_path: Some(prompt_path),
            thread_id,
            mode: SessionMode::parse(&settings().session_mode).unwrap_or(SessionMode::StreamJson),
            project: task.project.clone(),
            task_id: Some(task.id.clone()),
            preferred_engine: task.engine_hint.as_deref().and_then(Engine::parse),
            timeout: Duration::from_secs(settings().task_timeout_secs),
        };

        let outcome = self.supervisor.run(request).await;

        // Post-completion git steps run regardless of exit code; partial
        // work still gets pushed for review.
        let post = self
            .workspaces
            .post_completion(machine, &workspace.workspace_path, &task.description)
            .await;

        // A concurrent cancel wins over whatever we were about to record
        if let Ok(Some(current)) = self.db.get_task(&task.id).await
            && current.status() == Some(TaskStatus::Cancelled)
        {
            tracing::info!(task_id = %task.id, "Task was cancelled during execution");
            return;
        }

        let (status, error_message) = match &outcome {
            Err(e) => (TaskStatus::Failed, Some(e.to_string())),
            Ok(o) if o.timed_out => (
                TaskStatus::Timeout,
                Some(format!("session exceeded {}s", settings().task_timeout_secs)),
            ),
            Ok(o) if o.wait_expired => (
                TaskStatus::Failed,
                Some("waited 30 minutes for a reply, none arrived".to_string()),
            ),
            Ok(o) if o.exit_code == 0 => (TaskStatus::Completed, None),
            Ok(o) => (
                TaskStatus::Failed,
                Some(format!("engine exited with code {}", o.exit_code)),
            ),
        };

        let (result_summary, result_json) = match &outcome {
            Ok(o) => (
                Some(truncate_chars(&o.transcript_text, SUMMARY_KEEP).to_string()),
                serde_json::to_string(&serde_json::json!({
                    "engine": o.engine.as_str(),
                    "turns": o.turns,
                    "total_cost_usd": o.total_cost_usd,
                    "total_duration_ms": o.total_duration_ms,
                    "exit_code": o.exit_code,
                }))
                .ok(),
            ),
            Err(_) => (None, None),
        };

        let completion = TaskCompletion {
            status,
            error_message: error_message.clone(),
            result_summary,
            result_json,
            files_changed: if post.files_changed.is_empty() {
                None
            } else {
                Some(post.files_changed.clone())
            },
            pr_url: post.pr_url.clone(),
        };
        if let Err(e) = self.db.complete_task(&task.id, &completion).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to persist task completion");
        }

        self.post_summary(&task, thread_id, status, &error_message, &post.pr_url, &post.files_changed)
            .await;

        // Transcript analysis runs in the background; the task result does
        // not wait on the memory store
        if let (Some(memory), Ok(o)) = (&self.memory, &outcome) {
            let memory = Arc::clone(memory);
            let project = task.project.clone();
            let task_id = task.id.clone();
            let transcript = o.transcript_text.clone();
            tokio::spawn(async move {
                if let Err(e) = memory.record_transcript(&project, &task_id, &transcript).await {
                    tracing::debug!(task_id = %task_id, error = %e, "Transcript ingestion failed");
                }
            });
        }

        match status {
            TaskStatus::Completed => counter!("tasks_completed_total").increment(1),
            TaskStatus::Timeout => counter!("tasks_timeout_total").increment(1),
            _ => counter!("tasks_failed_total").increment(1),
        }
        histogram!("task_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            task_id = %task.id,
            status = status.as_str(),
            elapsed_secs = started.elapsed().as_secs(),
            "Task finished"
        );
    }

    /// The project has no repository: ask the user what to do, bounded at
    /// five minutes. `create` makes a private repo named after the
    /// project, any other reply is a custom repo name, `cancel` fails the
    /// task.
    async fn no_repo_flow(
        &self,
        task: &TaskRow,
        thread_id: i64,
        machine: &str,
    ) -> Result<String, OrcError> {
        let prompt = format!(
            "Project `{}` has no repository.\n\
             Reply `create` to create a private repo, reply with a name to use a custom name, or `cancel`.",
            task.project
        );
        let _ = self.facade.send(Some(thread_id), &prompt).await;

        let deadline = Instant::now() + NO_REPO_WAIT;
        let reply = loop {
            if let Some(text) = self.state.pop_inbox(thread_id) {
                break text;
            }
            if Instant::now() >= deadline {
                return Err(OrcError::no_repo(
                    "no repository and no reply within 5 minutes",
                ));
            }
            tokio::time::sleep(NO_REPO_POLL).await;
        };

        let trimmed = reply.trim();
        if trimmed.eq_ignore_ascii_case("cancel") {
            return Err(OrcError::no_repo("repository creation cancelled by user"));
        }
        let name = if trimmed.eq_ignore_ascii_case("create") {
            task.project.clone()
        } else {
            trimmed.to_string()
        };

        match self.repo_host.create_repo(machine, &name).await {
            Ok(url) => {
                let _ = self
                    .facade
                    .send(Some(thread_id), &format!("Created repository {}", url))
                    .await;
                Ok(url)
            }
            Err(e) => Err(OrcError::no_repo(format!("repository creation failed: {}", e))),
        }
    }

    /// Merge synced env with whatever `.env` the checkout carries and
    /// write the result back.
    async fn materialize_env(&self, task: &TaskRow, machine: &str, workspace: &str) {
        let synced = match self.env_sync.fetch(&task.project).await {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(project = %task.project, error = %e, "Env sync fetch failed");
                return;
            }
        };
        if synced.is_empty() {
            return;
        }

        let local = match self
            .workspaces
            .read_env_file(machine, workspace)
            .await
        {
            Ok(content) => parse_env(&content),
            Err(_) => Default::default(),
        };

        let merged = merge_env(&synced, &local, &settings().machine_local_keys);
        if let Err(e) = self
            .workspaces
            .write_env_file(machine, workspace, &merged)
            .await
        {
            tracing::warn!(project = %task.project, error = %e, "Env file write failed");
        }
    }

    async fn memory_context(&self, task: &TaskRow) -> (Vec<String>, Vec<String>) {
        let Some(memory) = &self.memory else {
            return (Vec::new(), Vec::new());
        };
        let hits = memory
            .top_hits(&task.project, &task.description, MEMORY_TOP_K)
            .await
            .unwrap_or_default();
        let rules = memory.project_rules(&task.project).await.unwrap_or_default();
        (hits, rules)
    }

    /// Record a failure and tell the user where it happened. When no
    /// thread exists yet, the report goes to the main chat.
    async fn persist_failure(&self, task: &TaskRow, thread_id: Option<i64>, message: &str) {
        let message = truncate_chars(message, 2000).to_string();
        let completion = TaskCompletion {
            status: TaskStatus::Failed,
            error_message: Some(message.clone()),
            result_summary: None,
            result_json: None,
            files_changed: None,
            pr_url: None,
        };
        if let Err(e) = self.db.complete_task(&task.id, &completion).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to persist failure");
        }
        counter!("tasks_failed_total").increment(1);

        let text = format!("Task {} failed: {}", task.short_id(), message);
        let _ = self.facade.send(thread_id, &text).await;
        if let Some(tid) = thread_id {
            self.facade.rename_topic(tid, &format!("✗ {}", task.short_id())).await;
            self.facade.close_topic(tid).await;
        }
    }

    async fn post_summary(
        &self,
        task: &TaskRow,
        thread_id: i64,
        status: TaskStatus,
        error_message: &Option<String>,
        pr_url: &Option<String>,
        files_changed: &[String],
    ) {
        let mut summary = match status {
            TaskStatus::Completed => format!("Task {} completed", task.short_id()),
            TaskStatus::Timeout => format!("Task {} timed out", task.short_id()),
            _ => format!(
                "Task {} failed: {}",
                task.short_id(),
                error_message.as_deref().unwrap_or("unknown error")
            ),
        };
        if let Some(url) = pr_url {
            summary.push_str(&format!("\nPR: {}", url));
        }
        if !files_changed.is_empty() {
            summary.push_str(&format!("\nFiles changed: {}", files_changed.join(", ")));
        }

        let keyboard = CallbackData::DeleteTopic { thread_id }
            .encode()
            .map(|data| InlineKeyboard::new().row(vec![InlineKeyboard::button("Delete topic", data)]));

        let sent = match &keyboard {
            Some(kb) => self.facade.send_with_keyboard(Some(thread_id), &summary, kb).await,
            None => self.facade.send(Some(thread_id), &summary).await,
        };
        if sent.is_ok() {
            let _ = self.db.mark_task_notified(&task.id).await;
        }

        let marker = if status == TaskStatus::Completed { "✓" } else { "✗" };
        self.facade
            .rename_topic(thread_id, &format!("{} {}", marker, task.short_id()))
            .await;
        self.facade.close_topic(thread_id).await;
    }
}
