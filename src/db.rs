//! Embedded persistence. Schema init and typed row access for agents,
//! tasks, task messages, review comments, system prompts, logs, and
//! security events. Complex fields (`capabilities`, `history`,
//! `dependencies`, `payload`, `flags`) ride as JSON-encoded text columns per
//! the "JSON-in-text-columns" design note — the on-disk layout stays
//! schema-less while callers see typed structs.
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::WaahError;
use crate::models::{
    Agent, LogEntry, ReviewComment, SecurityEvent, SystemPrompt, Task, TaskMessage, TaskStatus,
};
use crate::Result;

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS aliases (
                alias TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                assigned_to TEXT,
                workspace_id TEXT,
                priority TEXT NOT NULL,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_assigned_to ON tasks(assigned_to);
            CREATE INDEX IF NOT EXISTS idx_tasks_workspace_id ON tasks(workspace_id);
            CREATE TABLE IF NOT EXISTS task_messages (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_messages_task_id ON task_messages(task_id);
            CREATE TABLE IF NOT EXISTS review_comments (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_review_comments_task_id ON review_comments(task_id);
            CREATE TABLE IF NOT EXISTS system_prompts (
                id TEXT PRIMARY KEY,
                agent_id TEXT,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_system_prompts_agent_id ON system_prompts(agent_id);
            CREATE TABLE IF NOT EXISTS agent_broadcast_pops (
                agent_id TEXT PRIMARY KEY,
                last_popped_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
            CREATE TABLE IF NOT EXISTS security_events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| WaahError::PersistenceFailure(format!("schema migration failed: {e}")))?;
        Ok(())
    }

    // --- agents ---

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let data = serde_json::to_string(agent)?;
        sqlx::query(
            "INSERT INTO agents (id, display_name, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET display_name = ?2, data = ?3, updated_at = ?4",
        )
        .bind(&agent.id)
        .bind(&agent.display_name)
        .bind(&data)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| WaahError::PersistenceFailure(format!("upserting agent: {e}")))?;

        sqlx::query("DELETE FROM aliases WHERE agent_id = ?1")
            .bind(&agent.id)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("clearing aliases: {e}")))?;

        for alias in &agent.aliases {
            sqlx::query("INSERT OR REPLACE INTO aliases (alias, agent_id) VALUES (?1, ?2)")
                .bind(alias.to_lowercase())
                .bind(&agent.id)
                .execute(&self.pool)
                .await
                .map_err(|e| WaahError::PersistenceFailure(format!("inserting alias: {e}")))?;
        }

        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT data FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("fetching agent: {e}")))?;
        row.map(|r| decode_json(&r, "data")).transpose()
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT agent_id FROM aliases WHERE alias = ?1")
            .bind(alias.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("resolving alias: {e}")))?;
        Ok(row.map(|r| r.try_get::<String, _>("agent_id")).transpose()?)
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT data FROM agents")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing agents: {e}")))?;
        rows.iter().map(|r| decode_json(r, "data")).collect()
    }

    // --- tasks ---

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        self.write_task(task).await
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        self.write_task(task).await
    }

    async fn write_task(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_string(task)?;
        let status = status_str(task.status);
        sqlx::query(
            "INSERT INTO tasks (id, status, assigned_to, workspace_id, priority, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET status = ?2, assigned_to = ?3, workspace_id = ?4,
                 priority = ?5, data = ?7",
        )
        .bind(&task.id)
        .bind(status)
        .bind(&task.assigned_to)
        .bind(&task.to.workspace_id)
        .bind(priority_str(task.priority))
        .bind(task.created_at.to_rfc3339())
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| WaahError::PersistenceFailure(format!("writing task: {e}")))?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("fetching task: {e}")))?;
        row.map(|r| decode_json(&r, "data")).transpose()
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE status = ?1")
            .bind(status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing tasks by status: {e}")))?;
        rows.iter().map(|r| decode_json(r, "data")).collect()
    }

    pub async fn list_completed_task_ids(&self) -> Result<std::collections::HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM tasks WHERE status = ?1")
            .bind(status_str(TaskStatus::Completed))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing completed tasks: {e}")))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(WaahError::from))
            .collect()
    }

    pub async fn list_tasks_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE assigned_to = ?1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing tasks for agent: {e}")))?;
        rows.iter().map(|r| decode_json(r, "data")).collect()
    }

    // --- task messages ---

    pub async fn insert_message(&self, message: &TaskMessage) -> Result<()> {
        let data = serde_json::to_string(message)?;
        sqlx::query("INSERT INTO task_messages (id, task_id, timestamp, data) VALUES (?1, ?2, ?3, ?4)")
            .bind(&message.id)
            .bind(&message.task_id)
            .bind(message.timestamp.to_rfc3339())
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("inserting task message: {e}")))?;
        Ok(())
    }

    pub async fn list_messages_for_task(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query("SELECT data FROM task_messages WHERE task_id = ?1 ORDER BY timestamp ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing task messages: {e}")))?;
        rows.iter().map(|r| decode_json(r, "data")).collect()
    }

    // --- review comments ---

    pub async fn insert_review_comment(&self, comment: &ReviewComment) -> Result<()> {
        let data = serde_json::to_string(comment)?;
        sqlx::query("INSERT INTO review_comments (id, task_id, data) VALUES (?1, ?2, ?3)")
            .bind(&comment.id)
            .bind(&comment.task_id)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("inserting review comment: {e}")))?;
        Ok(())
    }

    pub async fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>> {
        let rows = sqlx::query("SELECT data FROM review_comments WHERE task_id = ?1")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("listing review comments: {e}")))?;
        rows.iter().map(|r| decode_json(r, "data")).collect()
    }

    // --- system prompts ---

    pub async fn queue_system_prompt(&self, prompt: &SystemPrompt) -> Result<()> {
        let data = serde_json::to_string(prompt)?;
        sqlx::query("INSERT INTO system_prompts (id, agent_id, created_at, data) VALUES (?1, ?2, ?3, ?4)")
            .bind(&prompt.id)
            .bind(&prompt.agent_id)
            .bind(prompt.created_at.to_rfc3339())
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("queueing system prompt: {e}")))?;
        Ok(())
    }

    pub async fn pop_agent_specific_prompt(&self, agent_id: &str) -> Result<Option<SystemPrompt>> {
        let row = sqlx::query(
            "SELECT id, data FROM system_prompts WHERE agent_id = ?1 ORDER BY created_at ASC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WaahError::PersistenceFailure(format!("popping system prompt: {e}")))?;

        match row {
            None => Ok(None),
            Some(r) => {
                let id: String = r.try_get("id")?;
                let prompt: SystemPrompt = decode_json(&r, "data")?;
                sqlx::query("DELETE FROM system_prompts WHERE id = ?1")
                    .bind(&id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| WaahError::PersistenceFailure(format!("deleting system prompt: {e}")))?;
                Ok(Some(prompt))
            }
        }
    }

    pub async fn last_broadcast_pop(&self, agent_id: &str) -> Result<DateTime<Utc>> {
        let row = sqlx::query("SELECT last_popped_at FROM agent_broadcast_pops WHERE agent_id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("reading broadcast pop marker: {e}")))?;
        match row {
            Some(r) => {
                let s: String = r.try_get("last_popped_at")?;
                Ok(DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC))
            }
            None => Ok(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub async fn pop_broadcast_prompt(&self, agent_id: &str) -> Result<Option<SystemPrompt>> {
        let since = self.last_broadcast_pop(agent_id).await?;
        let row = sqlx::query(
            "SELECT data, created_at FROM system_prompts WHERE agent_id IS NULL AND created_at > ?1
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(since.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WaahError::PersistenceFailure(format!("popping broadcast prompt: {e}")))?;

        match row {
            None => Ok(None),
            Some(r) => {
                let prompt: SystemPrompt = decode_json(&r, "data")?;
                let created_at: String = r.try_get("created_at")?;
                sqlx::query(
                    "INSERT INTO agent_broadcast_pops (agent_id, last_popped_at) VALUES (?1, ?2)
                     ON CONFLICT(agent_id) DO UPDATE SET last_popped_at = ?2",
                )
                .bind(agent_id)
                .bind(created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| WaahError::PersistenceFailure(format!("updating broadcast pop marker: {e}")))?;
                Ok(Some(prompt))
            }
        }
    }

    // --- logs ---

    pub async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let data = serde_json::to_string(entry)?;
        sqlx::query("INSERT INTO logs (id, timestamp, data) VALUES (?1, ?2, ?3)")
            .bind(&entry.id)
            .bind(entry.timestamp.to_rfc3339())
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("appending log: {e}")))?;
        Ok(())
    }

    pub async fn truncate_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM logs WHERE timestamp < ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("truncating logs: {e}")))?;
        Ok(result.rows_affected())
    }

    // --- security events ---

    pub async fn record_security_event(&self, event: &SecurityEvent) -> Result<()> {
        let data = serde_json::to_string(event)?;
        sqlx::query("INSERT INTO security_events (id, timestamp, data) VALUES (?1, ?2, ?3)")
            .bind(&event.id)
            .bind(event.timestamp.to_rfc3339())
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| WaahError::PersistenceFailure(format!("recording security event: {e}")))?;
        Ok(())
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Blocked => "blocked",
        TaskStatus::PendingAck => "pending_ack",
        TaskStatus::Assigned => "assigned",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::InReview => "in_review",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn priority_str(priority: crate::models::Priority) -> &'static str {
    use crate::models::Priority;
    match priority {
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}
