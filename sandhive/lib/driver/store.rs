use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tokio::fs;

use crate::{SandhiveError, SandhiveResult};

use super::TaskConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the task database
pub static TASKS_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/driver/migrations");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What is kept about a task so it can be reclaimed after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// The task configuration.
    pub config: TaskConfig,

    /// The pid of the VMM's supervising process.
    pub pid: u32,

    /// The network slot.
    pub slot_idx: u32,

    /// When the task started.
    pub started_at: DateTime<Utc>,
}

/// The recovery records of a node, in SQLite.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskStore {
    /// Opens the task database at `db_path`, creating and migrating it as needed.
    pub async fn open(db_path: impl AsRef<Path>) -> SandhiveResult<Self> {
        let pool = init_db(db_path, &TASKS_DB_MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Saves the record of a task, replacing any previous one with the same id.
    pub async fn insert(&self, record: &TaskRecord) -> SandhiveResult<()> {
        let config_json = serde_json::to_string(&record.config)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks (
                sandbox_id, template_id, team_id, config_json, pid, slot_idx, started_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.config.sandbox_id)
        .bind(&record.config.template_id)
        .bind(&record.config.team_id)
        .bind(config_json)
        .bind(record.pid as i64)
        .bind(record.slot_idx as i64)
        .bind(record.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes the record of a task. Deleting a missing record is fine.
    pub async fn delete(&self, sandbox_id: &str) -> SandhiveResult<()> {
        sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE sandbox_id = ?
            "#,
        )
        .bind(sandbox_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the record of a task.
    pub async fn get(&self, sandbox_id: &str) -> SandhiveResult<Option<TaskRecord>> {
        let row = sqlx::query(
            r#"
            SELECT config_json, pid, slot_idx, started_at
            FROM tasks
            WHERE sandbox_id = ?
            "#,
        )
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Returns every record, oldest first.
    pub async fn list(&self) -> SandhiveResult<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT config_json, pid, slot_idx, started_at
            FROM tasks
            ORDER BY started_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> SandhiveResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    if !fs::try_exists(db_path).await? {
        fs::File::create(db_path).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> SandhiveResult<TaskRecord> {
    let config: TaskConfig = serde_json::from_str(&row.try_get::<String, _>("config_json")?)?;
    let started_at = DateTime::parse_from_rfc3339(&row.try_get::<String, _>("started_at")?)
        .map_err(SandhiveError::custom)?
        .with_timezone(&Utc);

    Ok(TaskRecord {
        config,
        pid: row.try_get::<i64, _>("pid")? as u32,
        slot_idx: row.try_get::<i64, _>("slot_idx")? as u32,
        started_at,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
