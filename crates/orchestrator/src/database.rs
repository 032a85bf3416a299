use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

use crate::config::settings;

const SCHEMA: &str = "orchestrator";

/// Message stamped on tasks reclaimed by the stale sweeper.
pub const STALE_TASK_MESSAGE: &str = "Executor crashed/restarted during execution";

/// A task in `claimed`/`running` whose heartbeat is older than this is
/// presumed orphaned by a dead worker.
pub const STALE_TASK_SECS: i64 = 600;

/// Task lifecycle states. Terminal states are exactly the ones that set
/// `completed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::WaitingInput => "waiting_input",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "claimed" => Some(TaskStatus::Claimed),
            "running" => Some(TaskStatus::Running),
            "waiting_input" => Some(TaskStatus::WaitingInput),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "timeout" => Some(TaskStatus::Timeout),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// The legal transition table. Every status change the executor makes
    /// must pass this check.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Claimed) => true,
            (Claimed, Running) => true,
            (Running, WaitingInput) => true,
            (WaitingInput, Running) => true,
            (WaitingInput, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Timeout) => true,
            // A claimed task can fail before the session ever starts
            (Claimed, Failed) => true,
            // Cancel is allowed from any non-terminal state
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub description: String,
    pub project: String,
    pub repo_url: Option<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub status: String,
    pub priority: i32,
    pub engine_hint: Option<String>,
    pub budget_usd: Option<f64>,
    pub orchestrator_id: Option<String>,
    pub assigned_machine: Option<String>,
    pub workspace_path: Option<String>,
    pub thread_id: Option<i64>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<String>,
    pub result_json: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub pr_url: Option<String>,
}

impl TaskRow {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Fields supplied when a task is created by the conversation flow.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub project: String,
    pub repo_url: Option<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub priority: i32,
    pub engine_hint: Option<String>,
    pub budget_usd: Option<f64>,
    pub assigned_machine: Option<String>,
    pub thread_id: Option<i64>,
}

/// Terminal outcome persisted by the executor.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub result_summary: Option<String>,
    pub result_json: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MachineRow {
    pub machine_id: String,
    pub display_name: String,
    pub projects: Vec<String>,
    pub max_concurrent: i32,
    pub active_tasks: i32,
    pub os: String,
    pub engine_priority: Vec<String>,
    pub health_url: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TopicRow {
    pub thread_id: i64,
    pub status: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

const TASK_COLUMNS: &str = "id, description, project, repo_url, source_branch, target_branch, \
     status, priority, engine_hint, budget_usd, orchestrator_id, assigned_machine, \
     workspace_path, thread_id, session_id, created_at, started_at, completed_at, \
     notified_at, error_message, result_summary, result_json, files_changed, pr_url";

const MACHINE_COLUMNS: &str = "machine_id, display_name, projects, max_concurrent, active_tasks, \
     os, engine_priority, health_url, last_heartbeat, status";

/// Create schema and all tables/indexes for the given schema name.
/// Used by both production initialization and integration tests.
pub async fn create_schema(pool: &PgPool, schema: &str) -> Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.tasks (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            project TEXT NOT NULL,
            repo_url TEXT,
            source_branch TEXT,
            target_branch TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            engine_hint TEXT,
            budget_usd DOUBLE PRECISION,
            orchestrator_id TEXT,
            assigned_machine TEXT,
            workspace_path TEXT,
            thread_id BIGINT,
            session_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            notified_at TIMESTAMPTZ,
            error_message TEXT,
            result_summary TEXT,
            result_json TEXT,
            files_changed TEXT[],
            pr_url TEXT
        )
        "#,
        schema
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.machines (
            machine_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            projects TEXT[] NOT NULL DEFAULT '{{}}',
            max_concurrent INTEGER NOT NULL DEFAULT 1,
            active_tasks INTEGER NOT NULL DEFAULT 0,
            os TEXT NOT NULL DEFAULT 'linux',
            engine_priority TEXT[] NOT NULL DEFAULT '{{}}',
            health_url TEXT,
            last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            status TEXT NOT NULL DEFAULT 'online'
        )
        "#,
        schema
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.topics (
            thread_id BIGINT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'active',
            task_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        schema
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON {}.tasks(status, assigned_machine, priority DESC, created_at)",
        schema
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_tasks_thread ON {}.tasks(thread_id)",
        schema
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_topics_status ON {}.topics(status)",
        schema
    ))
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    schema: String,
}

impl Database {
    pub async fn new() -> Result<Self> {
        let s = settings();
        let pool = PgPoolOptions::new()
            .max_connections(s.database_pool_size)
            .connect(&s.database_url)
            .await?;

        tracing::info!(
            pool_size = s.database_pool_size,
            "Database connection pool initialized"
        );

        create_schema(&pool, SCHEMA).await?;
        Ok(Self {
            pool,
            schema: SCHEMA.to_string(),
        })
    }

    /// Wrap an existing pool (integration tests use their own schema).
    pub fn with_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    /// Health check: verify the connection is alive.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // --- Task operations ---

    pub async fn create_task(&self, new: &NewTask) -> Result<TaskRow> {
        let id = uuid::Uuid::new_v4().to_string();
        let task = sqlx::query_as::<_, TaskRow>(&format!(
            "INSERT INTO {}.tasks (id, description, project, repo_url, source_branch, target_branch, \
             priority, engine_hint, budget_usd, assigned_machine, thread_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {}",
            self.schema, TASK_COLUMNS
        ))
        .bind(&id)
        .bind(&new.description)
        .bind(&new.project)
        .bind(&new.repo_url)
        .bind(&new.source_branch)
        .bind(&new.target_branch)
        .bind(new.priority)
        .bind(&new.engine_hint)
        .bind(new.budget_usd)
        .bind(&new.assigned_machine)
        .bind(new.thread_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(task)
    }

    /// Atomically claim the oldest highest-priority queued task for this
    /// machine. `FOR UPDATE SKIP LOCKED` guarantees at most one claimant
    /// observes any given row.
    pub async fn claim_next_task(
        &self,
        worker_id: &str,
        machine_id: &str,
    ) -> Result<Option<TaskRow>> {
        let task = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE {schema}.tasks SET status = 'claimed', orchestrator_id = $1, \
             assigned_machine = $2, started_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM {schema}.tasks \
                 WHERE status = 'queued' AND (assigned_machine = $2 OR assigned_machine IS NULL) \
                 ORDER BY priority DESC, created_at ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) RETURNING {columns}",
            schema = self.schema,
            columns = TASK_COLUMNS
        ))
        .bind(worker_id)
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let task = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM {}.tasks WHERE id = $1",
            TASK_COLUMNS, self.schema
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Look up a task by id prefix. Requires at least 4 characters and
    /// rejects SQL wildcard characters; ambiguity resolves to the latest
    /// `created_at`.
    pub async fn task_by_prefix(&self, prefix: &str) -> Result<Option<TaskRow>> {
        if prefix.len() < 4 {
            return Err(anyhow::anyhow!("task id prefix must be at least 4 characters"));
        }
        if !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(anyhow::anyhow!(
                "task id prefix may contain only hex digits and hyphens"
            ));
        }

        let task = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM {}.tasks WHERE id LIKE $1 ORDER BY created_at DESC LIMIT 1",
            TASK_COLUMNS, self.schema
        ))
        .bind(format!("{}%", prefix))
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET status = $2 WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_workspace(&self, id: &str, workspace: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET workspace_path = $2 WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(workspace)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_thread(&self, id: &str, thread_id: i64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET thread_id = $2 WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_session(&self, id: &str, session_id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET session_id = $2 WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Application-level heartbeat: refresh `started_at` while the session
    /// runs so the stale sweeper leaves healthy tasks alone.
    pub async fn refresh_task_heartbeat(&self, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET started_at = NOW() WHERE id = $1 AND status IN ('claimed', 'running', 'waiting_input')",
            self.schema
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_task(&self, id: &str, completion: &TaskCompletion) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET status = $2, completed_at = NOW(), error_message = $3, \
             result_summary = $4, result_json = $5, files_changed = $6, pr_url = $7 \
             WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(completion.status.as_str())
        .bind(&completion.error_message)
        .bind(&completion.result_summary)
        .bind(&completion.result_json)
        .bind(&completion.files_changed)
        .bind(&completion.pr_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_task_notified(&self, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.tasks SET notified_at = NOW() WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a task unless it already reached a terminal state. Returns
    /// the row when the cancel took effect.
    pub async fn cancel_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let task = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE {}.tasks SET status = 'cancelled', completed_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed', 'timeout', 'cancelled') \
             RETURNING {}",
            self.schema, TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Fail every claimed/running task on the given machine whose heartbeat
    /// lapsed. Run at worker startup and periodically by the sweeper.
    pub async fn fail_stale_tasks(&self, machine_id: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {}.tasks SET status = 'failed', completed_at = NOW(), error_message = $2 \
             WHERE assigned_machine = $1 AND status IN ('claimed', 'running') \
             AND started_at < NOW() - INTERVAL '1 second' * $3",
            self.schema
        ))
        .bind(machine_id)
        .bind(STALE_TASK_MESSAGE)
        .bind(STALE_TASK_SECS as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Machine operations ---

    /// Upsert a machine row; mutable fields are last-writer-wins.
    pub async fn upsert_machine(&self, machine: &MachineRow) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.machines ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), $9) \
             ON CONFLICT (machine_id) DO UPDATE SET display_name = $2, projects = $3, \
             max_concurrent = $4, active_tasks = $5, os = $6, engine_priority = $7, \
             health_url = $8, last_heartbeat = NOW(), status = $9",
            self.schema, MACHINE_COLUMNS
        ))
        .bind(&machine.machine_id)
        .bind(&machine.display_name)
        .bind(&machine.projects)
        .bind(machine.max_concurrent)
        .bind(machine.active_tasks)
        .bind(&machine.os)
        .bind(&machine.engine_priority)
        .bind(&machine.health_url)
        .bind(&machine.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Heartbeat: refresh the timestamp and derive status from load.
    pub async fn heartbeat_machine(&self, machine_id: &str, active_tasks: i32) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.machines SET last_heartbeat = NOW(), active_tasks = $2, \
             status = CASE WHEN $2 > 0 THEN 'busy' ELSE 'online' END \
             WHERE machine_id = $1",
            self.schema
        ))
        .bind(machine_id)
        .bind(active_tasks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_machines(&self) -> Result<Vec<MachineRow>> {
        let machines = sqlx::query_as::<_, MachineRow>(&format!(
            "SELECT {} FROM {}.machines ORDER BY display_name",
            MACHINE_COLUMNS, self.schema
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(machines)
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRow>> {
        let machine = sqlx::query_as::<_, MachineRow>(&format!(
            "SELECT {} FROM {}.machines WHERE machine_id = $1",
            MACHINE_COLUMNS, self.schema
        ))
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(machine)
    }

    /// Mark machines whose heartbeat lapsed as offline. Returns the number
    /// swept.
    pub async fn sweep_stale_machines(&self, stale_secs: i64) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {}.machines SET status = 'offline' \
             WHERE status != 'offline' AND last_heartbeat < NOW() - INTERVAL '1 second' * $1",
            self.schema
        ))
        .bind(stale_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Topic registry ---

    pub async fn upsert_topic(&self, thread_id: i64, status: &str, task_id: Option<&str>) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.topics (thread_id, status, task_id) VALUES ($1, $2, $3) \
             ON CONFLICT (thread_id) DO UPDATE SET status = $2, task_id = COALESCE($3, {}.topics.task_id)",
            self.schema, self.schema
        ))
        .bind(thread_id)
        .bind(status)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_topic(&self, thread_id: i64) -> Result<Option<TopicRow>> {
        let topic = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT thread_id, status, task_id, created_at FROM {}.topics WHERE thread_id = $1",
            self.schema
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(topic)
    }

    pub async fn list_topics_by_status(&self, status: &str) -> Result<Vec<TopicRow>> {
        let topics = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT thread_id, status, task_id, created_at FROM {}.topics WHERE status = $1",
            self.schema
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(topics)
    }

    pub async fn set_topic_status(&self, thread_id: i64, status: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.topics SET status = $2 WHERE thread_id = $1",
            self.schema
        ))
        .bind(thread_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::WaitingInput.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingInput));
        assert!(WaitingInput.can_transition_to(Running));
        assert!(WaitingInput.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Timeout));
        assert!(Claimed.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Cancelled));
    }

    #[test]
    fn illegal_transitions() {
        use TaskStatus::*;
        assert!(!Queued.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Claimed.can_transition_to(WaitingInput));
        assert!(!Timeout.can_transition_to(Queued));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Claimed,
            TaskStatus::Running,
            TaskStatus::WaitingInput,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn short_id_handles_short_strings() {
        let mut row = sample_row();
        row.id = "abc".into();
        assert_eq!(row.short_id(), "abc");
        row.id = "a1b2c3d4e5".into();
        assert_eq!(row.short_id(), "a1b2c3d4");
    }

    fn sample_row() -> TaskRow {
        TaskRow {
            id: "a1b2c3d4".into(),
            description: "add readme".into(),
            project: "foo".into(),
            repo_url: None,
            source_branch: None,
            target_branch: None,
            status: "queued".into(),
            priority: 0,
            engine_hint: None,
            budget_usd: None,
            orchestrator_id: None,
            assigned_machine: None,
            workspace_path: None,
            thread_id: None,
            session_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            notified_at: None,
            error_message: None,
            result_summary: None,
            result_json: None,
            files_changed: None,
            pr_url: None,
        }
    }
}
