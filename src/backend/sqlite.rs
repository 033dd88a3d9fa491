//! SQLite backend over sqlx.
//!
//! Tables follow the persisted layout: `instances`, `pending_events`,
//! `history` and `activities`. Leasing and task commit each run in a single
//! transaction, which is what makes the pending-to-history move, command
//! materialization and lock release atomic.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{ActivityTask, Backend, BackendError, BackendOptions, TaskKind, WorkflowTask};
use crate::history::{Event, EventKind, WorkflowEvent};
use crate::{new_guid, now_ms, WorkflowInstance};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    parent_instance_id TEXT,
    parent_schedule_event_id INTEGER,
    locked_until INTEGER,
    sticky_until INTEGER,
    worker TEXT,
    completed_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_events (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    visible_at INTEGER,
    event_data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_instance ON pending_events(instance_id, visible_at);

CREATE TABLE IF NOT EXISTS history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    event_data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_instance ON history(instance_id, seq);

CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    schedule_event_id INTEGER NOT NULL,
    event_data TEXT NOT NULL,
    locked_until INTEGER,
    worker TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activities_lock ON activities(locked_until);
"#;

/// Durable backend. One value per worker process; the worker name recorded
/// in leases comes from it.
pub struct SqliteBackend {
    pool: SqlitePool,
    options: BackendOptions,
    worker_name: String,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub async fn new(path: impl AsRef<Path>, options: BackendOptions) -> Result<Self, BackendError> {
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await
            .map_err(storage("connect"))?;
        Self::with_pool(pool, options).await
    }

    /// Private in-memory database, mainly for tests.
    pub async fn new_in_memory(options: BackendOptions) -> Result<Self, BackendError> {
        let connect = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage("connect"))?;
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(storage("connect"))?;
        Self::with_pool(pool, options).await
    }

    async fn with_pool(pool: SqlitePool, options: BackendOptions) -> Result<Self, BackendError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(storage("create_schema"))?;
        Ok(Self {
            pool,
            options,
            worker_name: format!("worker-{}", new_guid()),
        })
    }

    /// Override the generated worker identity. Lets tests model two workers
    /// sharing one database file.
    pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    fn lock_deadline(&self, timeout: Duration) -> i64 {
        (now_ms() + timeout.as_millis() as u64) as i64
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> BackendError {
    move |e| BackendError::retryable(operation, e.to_string())
}

fn encode_event(operation: &'static str, event: &Event) -> Result<String, BackendError> {
    serde_json::to_string(event).map_err(|e| BackendError::permanent(operation, e.to_string()))
}

fn decode_event(operation: &'static str, data: &str) -> Result<Event, BackendError> {
    serde_json::from_str(data).map_err(|e| BackendError::permanent(operation, e.to_string()))
}

#[async_trait]
impl Backend for SqliteBackend {
    fn options(&self) -> BackendOptions {
        self.options.clone()
    }

    async fn create_workflow_instance(&self, event: WorkflowEvent) -> Result<(), BackendError> {
        const OP: &str = "create_workflow_instance";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;

        let existing = sqlx::query("SELECT execution_id FROM instances WHERE instance_id = ?")
            .bind(&event.instance.instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage(OP))?;
        if let Some(row) = existing {
            let execution_id: String = row.try_get("execution_id").map_err(storage(OP))?;
            if execution_id == event.instance.execution_id {
                return Ok(());
            }
            return Err(BackendError::AlreadyExists);
        }

        sqlx::query(
            "INSERT INTO instances (instance_id, execution_id, parent_instance_id, parent_schedule_event_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.instance.instance_id)
        .bind(&event.instance.execution_id)
        .bind(&event.instance.parent_instance_id)
        .bind(event.instance.parent_schedule_event_id.map(|v| v as i64))
        .bind(now_ms() as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage(OP))?;

        insert_pending_event(&mut tx, OP, &event.instance.instance_id, &event.event).await?;
        tx.commit().await.map_err(storage(OP))
    }

    async fn cancel_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        const OP: &str = "cancel_workflow_instance";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;

        let root = sqlx::query("SELECT completed_at FROM instances WHERE instance_id = ?")
            .bind(&instance.instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage(OP))?;
        let Some(root) = root else {
            return Err(BackendError::NotFound(format!(
                "workflow instance {}",
                instance.instance_id
            )));
        };
        let root_completed: Option<i64> = root.try_get("completed_at").map_err(storage(OP))?;

        // Breadth-first over uncompleted descendants.
        let mut targets = vec![instance.instance_id.clone()];
        let mut cursor = 0;
        while cursor < targets.len() {
            let parent = targets[cursor].clone();
            cursor += 1;
            let rows = sqlx::query(
                "SELECT instance_id FROM instances WHERE parent_instance_id = ? AND completed_at IS NULL",
            )
            .bind(&parent)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage(OP))?;
            for row in rows {
                targets.push(row.try_get("instance_id").map_err(storage(OP))?);
            }
        }

        for target in targets {
            if target == instance.instance_id && root_completed.is_some() {
                continue;
            }
            let event = Event::new(EventKind::WorkflowCancellationRequested);
            insert_pending_event(&mut tx, OP, &target, &event).await?;
        }
        tx.commit().await.map_err(storage(OP))
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError> {
        const OP: &str = "signal_workflow";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;
        let exists = sqlx::query("SELECT 1 FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage(OP))?;
        if exists.is_none() {
            return Err(BackendError::NotFound(format!("workflow instance {instance_id}")));
        }
        insert_pending_event(&mut tx, OP, instance_id, &event).await?;
        tx.commit().await.map_err(storage(OP))
    }

    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        const OP: &str = "get_workflow_task";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;
        let now = now_ms() as i64;

        let row = sqlx::query(
            "UPDATE instances SET locked_until = ?1, worker = ?2
             WHERE instance_id = (
                 SELECT i.instance_id FROM instances i
                 WHERE (i.locked_until IS NULL OR i.locked_until < ?3)
                   AND (i.sticky_until IS NULL OR i.sticky_until < ?3 OR i.worker = ?2)
                   AND i.completed_at IS NULL
                   AND EXISTS (
                       SELECT 1 FROM pending_events p
                       WHERE p.instance_id = i.instance_id
                         AND (p.visible_at IS NULL OR p.visible_at <= ?3)
                   )
                 LIMIT 1
             )
             RETURNING instance_id, execution_id, parent_instance_id, parent_schedule_event_id, sticky_until",
        )
        .bind(self.lock_deadline(self.options.workflow_lock_timeout))
        .bind(&self.worker_name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage(OP))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let instance_id: String = row.try_get("instance_id").map_err(storage(OP))?;
        let execution_id: String = row.try_get("execution_id").map_err(storage(OP))?;
        let parent_instance_id: Option<String> = row.try_get("parent_instance_id").map_err(storage(OP))?;
        let parent_schedule_event_id: Option<i64> =
            row.try_get("parent_schedule_event_id").map_err(storage(OP))?;
        let sticky_until: Option<i64> = row.try_get("sticky_until").map_err(storage(OP))?;

        let instance = match (parent_instance_id, parent_schedule_event_id) {
            (Some(parent), Some(schedule_event_id)) => WorkflowInstance::new_sub_workflow(
                instance_id.clone(),
                execution_id,
                parent,
                schedule_event_id as u64,
            ),
            _ => WorkflowInstance::new(instance_id.clone(), execution_id),
        };
        let kind = if sticky_until.is_some_and(|s| s > now) {
            TaskKind::Continuation
        } else {
            TaskKind::New
        };

        let pending_rows = sqlx::query(
            "SELECT event_data FROM pending_events
             WHERE instance_id = ? AND (visible_at IS NULL OR visible_at <= ?)
             ORDER BY rowid",
        )
        .bind(&instance_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage(OP))?;
        let mut new_events = Vec::with_capacity(pending_rows.len());
        for row in pending_rows {
            let data: String = row.try_get("event_data").map_err(storage(OP))?;
            new_events.push(decode_event(OP, &data)?);
        }
        if new_events.is_empty() {
            // Visibility raced away between the lease and the read; drop the
            // transaction so the lock is not persisted.
            return Ok(None);
        }

        let history_query = match kind {
            TaskKind::New => "SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq",
            TaskKind::Continuation => {
                "SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq DESC LIMIT 1"
            }
        };
        let history_rows = sqlx::query(history_query)
            .bind(&instance_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage(OP))?;
        let mut history = Vec::with_capacity(history_rows.len());
        for row in history_rows {
            let data: String = row.try_get("event_data").map_err(storage(OP))?;
            history.push(decode_event(OP, &data)?);
        }

        tx.commit().await.map_err(storage(OP))?;
        Ok(Some(WorkflowTask {
            instance,
            history,
            new_events,
            kind,
        }))
    }

    async fn extend_workflow_task(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        const OP: &str = "extend_workflow_task";
        let result = sqlx::query(
            "UPDATE instances SET locked_until = ? WHERE instance_id = ? AND execution_id = ? AND worker = ?",
        )
        .bind(self.lock_deadline(self.options.workflow_lock_timeout))
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(&self.worker_name)
        .execute(&self.pool)
        .await
        .map_err(storage(OP))?;
        if result.rows_affected() == 0 {
            return Err(BackendError::LostLease);
        }
        Ok(())
    }

    async fn complete_workflow_task(
        &self,
        instance: &WorkflowInstance,
        executed_events: Vec<Event>,
        produced_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError> {
        const OP: &str = "complete_workflow_task";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;
        let now = now_ms() as i64;

        // Unlock, but keep the instance sticky to this worker.
        let unlocked = sqlx::query(
            "UPDATE instances SET locked_until = NULL, sticky_until = ?
             WHERE instance_id = ? AND execution_id = ? AND worker = ?",
        )
        .bind((now_ms() + self.options.sticky_timeout.as_millis() as u64) as i64)
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(&self.worker_name)
        .execute(&mut *tx)
        .await
        .map_err(storage(OP))?;
        if unlocked.rows_affected() != 1 {
            return Err(BackendError::LostLease);
        }

        let mut completed = false;
        for event in &executed_events {
            sqlx::query("DELETE FROM pending_events WHERE instance_id = ? AND id = ?")
                .bind(&instance.instance_id)
                .bind(&event.id)
                .execute(&mut *tx)
                .await
                .map_err(storage(OP))?;
            sqlx::query("INSERT INTO history (id, instance_id, event_data, created_at) VALUES (?, ?, ?, ?)")
                .bind(&event.id)
                .bind(&instance.instance_id)
                .bind(encode_event(OP, event)?)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(storage(OP))?;

            match &event.kind {
                EventKind::ActivityScheduled { .. } => {
                    sqlx::query(
                        "INSERT INTO activities (id, instance_id, execution_id, schedule_event_id, event_data, created_at)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&event.id)
                    .bind(&instance.instance_id)
                    .bind(&instance.execution_id)
                    .bind(event.schedule_event_id as i64)
                    .bind(encode_event(OP, event)?)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage(OP))?;
                }
                EventKind::WorkflowExecutionFinished { .. } => completed = true,
                _ => {}
            }
        }

        for we in &produced_events {
            if we.instance.instance_id != instance.instance_id {
                sqlx::query(
                    "INSERT OR IGNORE INTO instances
                         (instance_id, execution_id, parent_instance_id, parent_schedule_event_id, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&we.instance.instance_id)
                .bind(&we.instance.execution_id)
                .bind(&we.instance.parent_instance_id)
                .bind(we.instance.parent_schedule_event_id.map(|v| v as i64))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(storage(OP))?;
            }
            // A completed target can never be leased again; dropping the
            // event here keeps pending_events from accumulating orphans.
            let target_completed: Option<Option<i64>> =
                sqlx::query_scalar("SELECT completed_at FROM instances WHERE instance_id = ?")
                    .bind(&we.instance.instance_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage(OP))?;
            match target_completed {
                Some(None) => {}
                Some(Some(_)) => {
                    debug!(instance_id = %we.instance.instance_id, "dropping event for completed instance");
                    continue;
                }
                None => continue,
            }
            insert_pending_event(&mut tx, OP, &we.instance.instance_id, &we.event).await?;
        }

        if completed {
            sqlx::query("UPDATE instances SET completed_at = ? WHERE instance_id = ? AND execution_id = ?")
                .bind(now)
                .bind(&instance.instance_id)
                .bind(&instance.execution_id)
                .execute(&mut *tx)
                .await
                .map_err(storage(OP))?;
        }

        tx.commit().await.map_err(storage(OP))
    }

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        const OP: &str = "get_activity_task";
        let now = now_ms() as i64;
        let row = sqlx::query(
            "UPDATE activities SET locked_until = ?1, worker = ?2
             WHERE id = (
                 SELECT id FROM activities
                 WHERE locked_until IS NULL OR locked_until < ?3
                 ORDER BY rowid LIMIT 1
             )
             RETURNING id, instance_id, execution_id, event_data",
        )
        .bind(self.lock_deadline(self.options.activity_lock_timeout))
        .bind(&self.worker_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage(OP))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(storage(OP))?;
        let instance_id: String = row.try_get("instance_id").map_err(storage(OP))?;
        let execution_id: String = row.try_get("execution_id").map_err(storage(OP))?;
        let data: String = row.try_get("event_data").map_err(storage(OP))?;
        Ok(Some(ActivityTask {
            id,
            instance: WorkflowInstance::new(instance_id, execution_id),
            event: decode_event(OP, &data)?,
        }))
    }

    async fn extend_activity_task(&self, activity_id: &str) -> Result<(), BackendError> {
        const OP: &str = "extend_activity_task";
        let result = sqlx::query("UPDATE activities SET locked_until = ? WHERE id = ? AND worker = ?")
            .bind(self.lock_deadline(self.options.activity_lock_timeout))
            .bind(activity_id)
            .bind(&self.worker_name)
            .execute(&self.pool)
            .await
            .map_err(storage(OP))?;
        if result.rows_affected() == 0 {
            return Err(BackendError::LostLease);
        }
        Ok(())
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        activity_id: &str,
        result_event: Event,
    ) -> Result<(), BackendError> {
        const OP: &str = "complete_activity_task";
        let mut tx = self.pool.begin().await.map_err(storage(OP))?;
        let deleted = sqlx::query("DELETE FROM activities WHERE instance_id = ? AND id = ? AND worker = ?")
            .bind(&instance.instance_id)
            .bind(activity_id)
            .bind(&self.worker_name)
            .execute(&mut *tx)
            .await
            .map_err(storage(OP))?;
        if deleted.rows_affected() != 1 {
            return Err(BackendError::LostLease);
        }
        insert_pending_event(&mut tx, OP, &instance.instance_id, &result_event).await?;
        tx.commit().await.map_err(storage(OP))
    }

    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, BackendError> {
        const OP: &str = "read_history";
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage(OP))?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("event_data").map_err(storage(OP))?;
            events.push(decode_event(OP, &data)?);
        }
        Ok(events)
    }
}

async fn insert_pending_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    operation: &'static str,
    instance_id: &str,
    event: &Event,
) -> Result<(), BackendError> {
    sqlx::query(
        "INSERT OR IGNORE INTO pending_events (id, instance_id, visible_at, event_data, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(instance_id)
    .bind(event.visible_at_ms.map(|v| v as i64))
    .bind(encode_event(operation, event)?)
    .bind(now_ms() as i64)
    .execute(&mut **tx)
    .await
    .map_err(storage(operation))?;
    Ok(())
}
