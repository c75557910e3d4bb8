use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{DevelopmentPlan, Step, StepStatus};

/// Async-safe handle to the workflow database.
///
/// Wraps `WorkflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkflowDb>>,
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkflowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// One durable snapshot of workflow state.
///
/// Rows are append-only per `thread_id`; the row with the highest rowid is
/// the resumable head. The `state` and `metadata` payloads are opaque JSON
/// to the store; deserialization happens at the workflow layer.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub state: String,
    pub metadata: String,
    pub created_at: String,
}

/// Condensed plan row for listings.
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub id: Uuid,
    pub original_request: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub total_steps: i64,
    pub completed_steps: i64,
}

pub struct WorkflowDb {
    conn: Connection,
}

impl WorkflowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    checkpoint_id TEXT NOT NULL,
                    parent_checkpoint_id TEXT,
                    type TEXT NOT NULL DEFAULT 'json',
                    checkpoint TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(thread_id, checkpoint_id)
                );

                CREATE TABLE IF NOT EXISTS plans (
                    id TEXT PRIMARY KEY,
                    original_request TEXT NOT NULL,
                    project_path TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id TEXT PRIMARY KEY,
                    plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    description TEXT NOT NULL,
                    role TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    result TEXT NOT NULL DEFAULT '',
                    logs TEXT NOT NULL DEFAULT ''
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id);
                CREATE INDEX IF NOT EXISTS idx_steps_plan ON steps(plan_id, position);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Append a checkpoint for `thread_id` and return its id.
    ///
    /// The parent link is derived from the current head, so each thread
    /// forms a single chain. The row is durable once this returns.
    pub fn put_checkpoint(&self, thread_id: &str, state: &str, metadata: &str) -> Result<String> {
        let parent = self.head_checkpoint_id(thread_id)?;
        let checkpoint_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_checkpoint_id, type, checkpoint, metadata)
                 VALUES (?1, ?2, ?3, 'json', ?4, ?5)",
                params![thread_id, checkpoint_id, parent, state, metadata],
            )
            .context("Failed to insert checkpoint")?;
        Ok(checkpoint_id)
    }

    fn head_checkpoint_id(&self, thread_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT checkpoint_id FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
            )
            .context("Failed to prepare head_checkpoint_id")?;
        let mut rows = stmt
            .query_map(params![thread_id], |row| row.get::<_, String>(0))
            .context("Failed to query checkpoint head")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read checkpoint head")?)),
            None => Ok(None),
        }
    }

    /// Most recent checkpoint for a thread, or None for an unknown thread.
    pub fn latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at
                 FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
            )
            .context("Failed to prepare latest_checkpoint")?;
        let mut rows = stmt
            .query_map(params![thread_id], |row| {
                Ok(Checkpoint {
                    thread_id: row.get(0)?,
                    checkpoint_id: row.get(1)?,
                    parent_checkpoint_id: row.get(2)?,
                    state: row.get(3)?,
                    metadata: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query latest checkpoint")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read checkpoint row")?)),
            None => Ok(None),
        }
    }

    pub fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at
                 FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
            )
            .context("Failed to prepare get_checkpoint")?;
        let mut rows = stmt
            .query_map(params![thread_id, checkpoint_id], |row| {
                Ok(Checkpoint {
                    thread_id: row.get(0)?,
                    checkpoint_id: row.get(1)?,
                    parent_checkpoint_id: row.get(2)?,
                    state: row.get(3)?,
                    metadata: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query checkpoint")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read checkpoint row")?)),
            None => Ok(None),
        }
    }

    /// Checkpoints for a thread, most recent first.
    pub fn list_checkpoints(&self, thread_id: &str, limit: i64) -> Result<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at
                 FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare list_checkpoints")?;
        let rows = stmt
            .query_map(params![thread_id, limit], |row| {
                Ok(Checkpoint {
                    thread_id: row.get(0)?,
                    checkpoint_id: row.get(1)?,
                    parent_checkpoint_id: row.get(2)?,
                    state: row.get(3)?,
                    metadata: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query checkpoints")?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row.context("Failed to read checkpoint row")?);
        }
        Ok(checkpoints)
    }

    // ── Plans ─────────────────────────────────────────────────────────

    /// Persist a plan and its steps in one transaction. The plan id comes
    /// from the caller; a re-insert of the same id is an error the caller
    /// handles as best-effort.
    pub fn create_plan(&self, plan: &DevelopmentPlan) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO plans (id, original_request, project_path, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                plan.id.to_string(),
                plan.original_request,
                plan.project_path,
                plan.created_at.to_rfc3339()
            ],
        )
        .context("Failed to insert plan")?;
        for (position, step) in plan.steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO steps (id, plan_id, position, description, role, status, result, logs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.id.to_string(),
                    plan.id.to_string(),
                    position as i64,
                    step.description,
                    step.role.as_str(),
                    step.status.as_str(),
                    step.result,
                    step.logs
                ],
            )
            .context("Failed to insert step")?;
        }
        tx.commit().context("Failed to commit plan insert")?;
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &Uuid) -> Result<Option<DevelopmentPlan>> {
        let id_str = plan_id.to_string();
        let mut stmt = self
            .conn
            .prepare("SELECT id, original_request, project_path, created_at FROM plans WHERE id = ?1")
            .context("Failed to prepare get_plan")?;
        let mut rows = stmt
            .query_map(params![id_str], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query plan")?;
        let (id, original_request, project_path, created_at) = match rows.next() {
            Some(row) => row.context("Failed to read plan row")?,
            None => return Ok(None),
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, description, role, status, result, logs
                 FROM steps WHERE plan_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare get_plan steps")?;
        let step_rows = stmt
            .query_map(params![id_str], |row| {
                Ok(StepRow {
                    id: row.get(0)?,
                    description: row.get(1)?,
                    role: row.get(2)?,
                    status: row.get(3)?,
                    result: row.get(4)?,
                    logs: row.get(5)?,
                })
            })
            .context("Failed to query plan steps")?;
        let mut steps = Vec::new();
        for row in step_rows {
            steps.push(row.context("Failed to read step row")?.into_step()?);
        }

        Ok(Some(DevelopmentPlan {
            id: Uuid::parse_str(&id)
                .with_context(|| format!("Invalid plan id in database: '{}'", id))?,
            original_request,
            project_path,
            steps,
            created_at: parse_stored_datetime(&created_at)?,
        }))
    }

    /// Update one step's status, result, and logs.
    pub fn update_step(
        &self,
        step_id: &Uuid,
        status: &StepStatus,
        result: &str,
        logs: &str,
    ) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE steps SET status = ?1, result = ?2, logs = ?3 WHERE id = ?4",
                params![status.as_str(), result, logs, step_id.to_string()],
            )
            .context("Failed to update step")?;
        if count == 0 {
            anyhow::bail!("Step not found: {}", step_id);
        }
        Ok(())
    }

    /// Stored plans, newest first.
    pub fn list_plans(&self, limit: i64) -> Result<Vec<PlanSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id, p.original_request, p.project_path, p.created_at,
                        (SELECT COUNT(*) FROM steps s WHERE s.plan_id = p.id),
                        (SELECT COUNT(*) FROM steps s WHERE s.plan_id = p.id AND s.status = 'COMPLETED')
                 FROM plans p ORDER BY p.rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .context("Failed to query plans")?;
        let mut plans = Vec::new();
        for row in rows {
            let (id, original_request, project_path, created_at, total_steps, completed_steps) =
                row.context("Failed to read plan row")?;
            plans.push(PlanSummary {
                id: Uuid::parse_str(&id)
                    .with_context(|| format!("Invalid plan id in database: '{}'", id))?,
                original_request,
                project_path,
                created_at: parse_stored_datetime(&created_at)?,
                total_steps,
                completed_steps,
            });
        }
        Ok(plans)
    }
}

fn parse_stored_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid created_at in database: '{}'", raw))
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading steps from SQLite before converting
/// role / status strings into typed values.
struct StepRow {
    id: String,
    description: String,
    role: String,
    status: String,
    result: String,
    logs: String,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let role = self
            .role
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid role in database: '{}'", self.role))?;
        let status = self
            .status
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid status in database: '{}'", self.status))?;
        Ok(Step {
            id: Uuid::parse_str(&self.id)
                .with_context(|| format!("Invalid step id in database: '{}'", self.id))?,
            description: self.description,
            role,
            status,
            result: self.result,
            logs: self.logs,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRole;

    fn sample_plan() -> DevelopmentPlan {
        DevelopmentPlan::new(
            "Add a health endpoint",
            "/tmp/project",
            vec![
                Step::new("Write the handler", AgentRole::Fullstack),
                Step::new("Wire up the route", AgentRole::Devops),
            ],
        )
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('checkpoints', 'plans', 'steps')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");

        let index_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name IN ('idx_checkpoints_thread', 'idx_steps_plan')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 2, "Expected 2 indexes to exist");

        Ok(())
    }

    #[test]
    fn test_put_checkpoint_and_read_latest() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        let first = db.put_checkpoint("plan-1", r#"{"step":0}"#, r#"{"node":"planner"}"#)?;
        let second = db.put_checkpoint("plan-1", r#"{"step":1}"#, r#"{"node":"executor"}"#)?;
        assert_ne!(first, second);

        let head = db.latest_checkpoint("plan-1")?.expect("head should exist");
        assert_eq!(head.checkpoint_id, second);
        assert_eq!(head.state, r#"{"step":1}"#);
        assert_eq!(head.metadata, r#"{"node":"executor"}"#);
        assert!(!head.created_at.is_empty());

        Ok(())
    }

    #[test]
    fn test_checkpoints_form_a_parent_chain() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        let first = db.put_checkpoint("plan-1", "{}", "{}")?;
        let second = db.put_checkpoint("plan-1", "{}", "{}")?;

        let root = db.get_checkpoint("plan-1", &first)?.expect("first exists");
        assert_eq!(root.parent_checkpoint_id, None);

        let child = db.get_checkpoint("plan-1", &second)?.expect("second exists");
        assert_eq!(child.parent_checkpoint_id, Some(first));

        Ok(())
    }

    #[test]
    fn test_get_checkpoint_unknown_id_returns_none() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        db.put_checkpoint("plan-1", "{}", "{}")?;

        assert!(db.get_checkpoint("plan-1", "no-such-id")?.is_none());
        assert!(db.latest_checkpoint("no-such-thread")?.is_none());

        Ok(())
    }

    #[test]
    fn test_list_checkpoints_most_recent_first() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        let a = db.put_checkpoint("plan-1", r#"{"n":1}"#, "{}")?;
        let b = db.put_checkpoint("plan-1", r#"{"n":2}"#, "{}")?;
        let c = db.put_checkpoint("plan-1", r#"{"n":3}"#, "{}")?;

        let all = db.list_checkpoints("plan-1", 10)?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].checkpoint_id, c);
        assert_eq!(all[1].checkpoint_id, b);
        assert_eq!(all[2].checkpoint_id, a);

        let limited = db.list_checkpoints("plan-1", 2)?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].checkpoint_id, c);

        Ok(())
    }

    #[test]
    fn test_threads_do_not_share_checkpoints() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        db.put_checkpoint("plan-1", r#"{"thread":1}"#, "{}")?;
        db.put_checkpoint("plan-2", r#"{"thread":2}"#, "{}")?;

        let head_one = db.latest_checkpoint("plan-1")?.expect("plan-1 head");
        let head_two = db.latest_checkpoint("plan-2")?.expect("plan-2 head");
        assert_eq!(head_one.state, r#"{"thread":1}"#);
        assert_eq!(head_two.state, r#"{"thread":2}"#);
        assert_eq!(db.list_checkpoints("plan-1", 10)?.len(), 1);

        // A new thread starts its own chain, unlinked from others.
        assert_eq!(head_two.parent_checkpoint_id, None);

        Ok(())
    }

    #[test]
    fn test_create_and_get_plan_roundtrip() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let plan = sample_plan();

        db.create_plan(&plan)?;
        let fetched = db.get_plan(&plan.id)?.expect("plan should exist");

        assert_eq!(fetched.id, plan.id);
        assert_eq!(fetched.original_request, "Add a health endpoint");
        assert_eq!(fetched.project_path, "/tmp/project");
        assert_eq!(fetched.steps.len(), 2);
        assert_eq!(fetched.steps[0].id, plan.steps[0].id);
        assert_eq!(fetched.steps[0].description, "Write the handler");
        assert_eq!(fetched.steps[0].role, AgentRole::Fullstack);
        assert_eq!(fetched.steps[0].status, StepStatus::Pending);
        assert_eq!(fetched.steps[1].role, AgentRole::Devops);
        assert_eq!(fetched.created_at.timestamp(), plan.created_at.timestamp());

        Ok(())
    }

    #[test]
    fn test_get_plan_unknown_id_returns_none() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        assert!(db.get_plan(&Uuid::new_v4())?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_step() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let plan = sample_plan();
        db.create_plan(&plan)?;

        db.update_step(
            &plan.steps[0].id,
            &StepStatus::Completed,
            "exit 0",
            "ran fine",
        )?;

        let fetched = db.get_plan(&plan.id)?.expect("plan should exist");
        assert_eq!(fetched.steps[0].status, StepStatus::Completed);
        assert_eq!(fetched.steps[0].result, "exit 0");
        assert_eq!(fetched.steps[0].logs, "ran fine");
        // Sibling step untouched.
        assert_eq!(fetched.steps[1].status, StepStatus::Pending);

        Ok(())
    }

    #[test]
    fn test_update_step_unknown_id_is_an_error() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let result = db.update_step(&Uuid::new_v4(), &StepStatus::Failed, "", "");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Step not found"));
        Ok(())
    }

    #[test]
    fn test_list_plans_newest_first_with_limit() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;

        let first = DevelopmentPlan::new("first", "/tmp/a", vec![]);
        let second = DevelopmentPlan::new("second", "/tmp/b", vec![]);
        let third = sample_plan();
        db.create_plan(&first)?;
        db.create_plan(&second)?;
        db.create_plan(&third)?;

        let all = db.list_plans(50)?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, third.id);
        assert_eq!(all[0].total_steps, 2);
        assert_eq!(all[0].completed_steps, 0);
        assert_eq!(all[2].id, first.id);

        let limited = db.list_plans(2)?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, third.id);

        Ok(())
    }

    #[test]
    fn test_completed_count_follows_step_updates() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let plan = sample_plan();
        db.create_plan(&plan)?;

        db.update_step(&plan.steps[0].id, &StepStatus::Completed, "done", "")?;

        let summaries = db.list_plans(50)?;
        assert_eq!(summaries[0].completed_steps, 1);
        assert_eq!(summaries[0].total_steps, 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_runs_closures_off_the_async_thread() -> Result<()> {
        let handle = DbHandle::new(WorkflowDb::new_in_memory()?);

        let id = handle
            .call(|db| db.put_checkpoint("plan-9", r#"{"step":0}"#, "{}"))
            .await?;
        let head = handle
            .call(|db| db.latest_checkpoint("plan-9"))
            .await?
            .expect("head should exist");
        assert_eq!(head.checkpoint_id, id);

        Ok(())
    }
}
