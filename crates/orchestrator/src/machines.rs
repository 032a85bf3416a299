use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::database::{Database, MachineRow};
use crate::engine::Engine;

/// A heartbeat younger than this means the machine is reachable.
pub const HB_FRESH_SECS: i64 = 60;
/// A heartbeat older than this gets the machine swept offline.
pub const HB_STALE_SECS: i64 = 120;
/// Workers heartbeat their machines on this cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Online,
    Busy,
    Offline,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Online => "online",
            MachineStatus::Busy => "busy",
            MachineStatus::Offline => "offline",
        }
    }
}

/// Status as derived from the row, not as stored: `online` iff the
/// heartbeat is fresh and the machine is idle, `busy` iff fresh and
/// loaded, else `offline`.
pub fn effective_status(machine: &MachineRow, now: DateTime<Utc>) -> MachineStatus {
    let age = (now - machine.last_heartbeat).num_seconds();
    if age >= HB_FRESH_SECS {
        MachineStatus::Offline
    } else if machine.active_tasks > 0 {
        MachineStatus::Busy
    } else {
        MachineStatus::Online
    }
}

fn has_capacity(machine: &MachineRow, now: DateTime<Utc>) -> bool {
    effective_status(machine, now) != MachineStatus::Offline
        && machine.active_tasks < machine.max_concurrent
}

/// Resolve a user-supplied machine alias, case-insensitively, in priority
/// order: exact id, exact display name, display-name substring, id
/// substring.
pub fn resolve_alias<'a>(machines: &'a [MachineRow], alias: &str) -> Option<&'a MachineRow> {
    let needle = alias.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    machines
        .iter()
        .find(|m| m.machine_id.to_lowercase() == needle)
        .or_else(|| {
            machines
                .iter()
                .find(|m| m.display_name.to_lowercase() == needle)
        })
        .or_else(|| {
            machines
                .iter()
                .find(|m| m.display_name.to_lowercase().contains(&needle))
        })
        .or_else(|| {
            machines
                .iter()
                .find(|m| m.machine_id.to_lowercase().contains(&needle))
        })
}

/// Pick the best machine for a project: one that already knows the project
/// wins; otherwise the machine with the most free slack.
pub fn best_for_project<'a>(
    machines: &'a [MachineRow],
    project: &str,
    now: DateTime<Utc>,
) -> Option<&'a MachineRow> {
    let candidates: Vec<&MachineRow> = machines.iter().filter(|m| has_capacity(m, now)).collect();

    candidates
        .iter()
        .find(|m| m.projects.iter().any(|p| p.as_str() == project))
        .copied()
        .or_else(|| {
            candidates
                .into_iter()
                .max_by_key(|m| m.max_concurrent - m.active_tasks)
        })
}

/// Durable machine registry backed by the store.
#[derive(Clone)]
pub struct MachineRegistry {
    db: Database,
}

impl MachineRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn register(&self, machine: &MachineRow) -> Result<()> {
        self.db.upsert_machine(machine).await
    }

    pub async fn heartbeat(&self, machine_id: &str, active_tasks: i32) -> Result<()> {
        self.db.heartbeat_machine(machine_id, active_tasks).await
    }

    pub async fn all(&self) -> Result<Vec<MachineRow>> {
        self.db.get_machines().await
    }

    pub async fn get(&self, machine_id: &str) -> Result<Option<MachineRow>> {
        self.db.get_machine(machine_id).await
    }

    /// Machines with a fresh heartbeat and free capacity.
    pub async fn available(&self) -> Result<Vec<MachineRow>> {
        let now = Utc::now();
        Ok(self
            .db
            .get_machines()
            .await?
            .into_iter()
            .filter(|m| has_capacity(m, now))
            .collect())
    }

    pub async fn best_for_project(&self, project: &str) -> Result<Option<MachineRow>> {
        let machines = self.db.get_machines().await?;
        Ok(best_for_project(&machines, project, Utc::now()).cloned())
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<MachineRow>> {
        let machines = self.db.get_machines().await?;
        Ok(resolve_alias(&machines, alias).cloned())
    }

    /// Sweep machines whose heartbeat lapsed past `HB_STALE_SECS`.
    pub async fn sweep_stale(&self) -> Result<u64> {
        let swept = self.db.sweep_stale_machines(HB_STALE_SECS).await?;
        if swept > 0 {
            tracing::info!(count = swept, "Marked stale machines offline");
        }
        Ok(swept)
    }

    /// Engine priority for a machine, falling back to the full catalogue
    /// when the row has none configured.
    pub async fn engine_priority(&self, machine_id: &str) -> Result<Vec<Engine>> {
        let machine = self.db.get_machine(machine_id).await?;
        let priority: Vec<Engine> = machine
            .map(|m| {
                m.engine_priority
                    .iter()
                    .filter_map(|s| Engine::parse(s))
                    .collect()
            })
            .unwrap_or_default();
        if priority.is_empty() {
            Ok(vec![Engine::Claude, Engine::Codex, Engine::Gemini])
        } else {
            Ok(priority)
        }
    }
}
