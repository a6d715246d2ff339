use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;

use super::{
    Frequency, LastRunStatus, NewScheduledJob, RunOutcome, RunRecord, ScheduleUpdate,
    ScheduledJob,
};
use crate::core::jobs::DEFAULT_MAX_STEPS;

/// Persistence for recurring templates.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active templates whose `next_run_at <= now`, oldest first.
    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>>;

    async fn list(&self) -> Result<Vec<ScheduledJob>>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>>;

    async fn create(&self, new: NewScheduledJob, now: DateTime<Utc>) -> Result<ScheduledJob>;

    async fn update(
        &self,
        id: &str,
        fields: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>>;

    /// Applies one dispatcher attempt: advances `next_run_at`, bumps `total_runs`
    /// and records the outcome in a single write.
    async fn record_run(&self, id: &str, record: RunRecord) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

const COLUMNS: &str = "id, title, prompt, start_url, max_turns, frequency, is_active, \
     last_run_at, last_job_id, last_status, last_error, total_runs, next_run_at, \
     created_at, updated_at";

pub struct SqliteScheduleStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteScheduleStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("opening schedule database {}", path.display()))?;
        Self::from_connection(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                prompt TEXT,
                start_url TEXT NOT NULL,
                max_turns INTEGER NOT NULL,
                frequency TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                last_job_id TEXT,
                last_status TEXT,
                last_error TEXT,
                total_runs INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
                ON scheduled_jobs (is_active, next_run_at)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let frequency: String = row.get(5)?;
    let frequency = Frequency::from_frequency(&frequency)
        .ok_or_else(|| conversion_error(5, format!("unknown frequency '{frequency}'")))?;
    let last_status: Option<String> = row.get(9)?;
    let last_status = match last_status {
        Some(s) => Some(
            LastRunStatus::from_status(&s)
                .ok_or_else(|| conversion_error(9, format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    let total_runs: i64 = row.get(11)?;

    Ok(ScheduledJob {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        start_url: row.get(3)?,
        max_turns: row.get(4)?,
        frequency,
        is_active: row.get(6)?,
        last_run_at: row.get(7)?,
        last_job_id: row.get(8)?,
        last_status,
        last_error: row.get(10)?,
        total_runs: total_runs.max(0) as u64,
        next_run_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn select_one(db: &Connection, id: &str) -> rusqlite::Result<Option<ScheduledJob>> {
    db.query_row(
        &format!("SELECT {COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
        params![id],
        row_to_job,
    )
    .optional()
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs
             WHERE is_active = 1 AND next_run_at <= ?1
             ORDER BY next_run_at ASC"
        ))?;
        let rows = stmt.query_map(params![now], row_to_job)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_job)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let db = self.db.lock().await;
        Ok(select_one(&db, id)?)
    }

    async fn create(&self, new: NewScheduledJob, now: DateTime<Utc>) -> Result<ScheduledJob> {
        let job = ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            prompt: new.prompt,
            start_url: new.start_url,
            max_turns: new.max_turns.unwrap_or(DEFAULT_MAX_STEPS),
            frequency: new.frequency,
            is_active: new.is_active.unwrap_or(true),
            last_run_at: None,
            last_job_id: None,
            last_status: None,
            last_error: None,
            total_runs: 0,
            next_run_at: new.frequency.next_run_after(now),
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_jobs
                (id, title, prompt, start_url, max_turns, frequency, is_active,
                 total_runs, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10)",
            params![
                job.id,
                job.title,
                job.prompt,
                job.start_url,
                job.max_turns,
                job.frequency.as_str(),
                job.is_active,
                job.next_run_at,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(job)
    }

    async fn update(
        &self,
        id: &str,
        fields: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>> {
        let db = self.db.lock().await;
        let Some(mut job) = select_one(&db, id)? else {
            return Ok(None);
        };

        if let Some(title) = fields.title {
            job.title = title;
        }
        if let Some(prompt) = fields.prompt {
            job.prompt = Some(prompt);
        }
        if let Some(start_url) = fields.start_url {
            job.start_url = start_url;
        }
        if let Some(max_turns) = fields.max_turns {
            job.max_turns = max_turns;
        }
        if let Some(frequency) = fields.frequency
            && frequency != job.frequency
        {
            job.frequency = frequency;
            job.next_run_at = frequency.next_run_after(now);
        }
        if let Some(is_active) = fields.is_active {
            job.is_active = is_active;
        }
        job.updated_at = now;

        db.execute(
            "UPDATE scheduled_jobs
             SET title = ?2, prompt = ?3, start_url = ?4, max_turns = ?5, frequency = ?6,
                 is_active = ?7, next_run_at = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                job.id,
                job.title,
                job.prompt,
                job.start_url,
                job.max_turns,
                job.frequency.as_str(),
                job.is_active,
                job.next_run_at,
                job.updated_at,
            ],
        )?;
        Ok(Some(job))
    }

    async fn record_run(&self, id: &str, record: RunRecord) -> Result<bool> {
        let (status, job_id, error) = match &record.outcome {
            RunOutcome::Started { job_id } => (LastRunStatus::Running, Some(job_id.as_str()), None),
            RunOutcome::Failed { error } => (LastRunStatus::Error, None, Some(error.as_str())),
        };
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scheduled_jobs
             SET last_run_at = ?2,
                 next_run_at = ?3,
                 last_status = ?4,
                 last_job_id = COALESCE(?5, last_job_id),
                 last_error = ?6,
                 total_runs = total_runs + 1,
                 updated_at = ?2
             WHERE id = ?1",
            params![
                id,
                record.ran_at,
                record.next_run_at,
                status.as_str(),
                job_id,
                error,
            ],
        )?;
        Ok(changed > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
        Ok(rows_deleted > 0)
    }
}
