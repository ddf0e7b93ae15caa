//! Job record storage.
//!
//! Provides SQLite-backed persistence for job records. The store is the only
//! authority on job status; every status change goes through [`JobStore::update`].

use super::error::{JobError, JobResult};
use super::models::*;
use super::schema::JOBS_VERSIONED_SCHEMAS;
use super::state_machine;
use crate::sqlite_persistence;
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Trait for job record storage operations.
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING record.
    fn create(&self, job: NewJob) -> JobResult<JobRecord>;

    /// Get a record by id, or `NotFound`.
    fn get(&self, id: &str) -> JobResult<JobRecord>;

    /// Look a record up by the id the queue knows it under.
    fn find_by_external_id(&self, external_job_id: &str) -> JobResult<Option<JobRecord>>;

    /// Apply a partial update, validating the status transition first.
    ///
    /// The write is conditional on the status and retry count read before
    /// validation, so a concurrent change makes this fail instead of being lost.
    fn update(&self, id: &str, patch: &JobPatch) -> JobResult<JobRecord>;

    /// Filtered, ordered, paginated listing. `total` ignores offset/limit.
    fn list(&self, filter: &JobFilter) -> JobResult<JobPage>;

    /// Grouped counts and average run time, optionally scoped.
    fn aggregate(&self, owner_user_id: Option<&str>, since: Option<i64>)
        -> JobResult<JobAggregates>;

    /// Records in PENDING, PROGRESS or RETRY, oldest first.
    fn list_unfinished(&self) -> JobResult<Vec<JobRecord>>;

    /// Delete terminal records completed before `cutoff`. Returns the count.
    fn purge_terminal_before(&self, cutoff: i64) -> JobResult<usize>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn =
            sqlite_persistence::open_versioned(db_path.as_ref(), JOBS_VERSIONED_SCHEMAS, "jobs")?;
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store, for tests and throwaway instances.
    pub fn in_memory() -> Result<Self> {
        let conn = sqlite_persistence::open_in_memory(JOBS_VERSIONED_SCHEMAS)?;
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> JobResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| JobError::Internal(anyhow::anyhow!("job store mutex poisoned")))
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn conversion_error(index: usize, value: &str) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("unexpected value '{}'", value).into(),
        )
    }

    /// Helper to convert a database row to a JobRecord.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let job_type: String = row.get("job_type")?;
        let status: String = row.get("status")?;
        let priority: i32 = row.get("priority")?;
        let tags: String = row.get("tags")?;

        Ok(JobRecord {
            id: row.get("id")?,
            external_job_id: row.get("external_job_id")?,
            name: row.get("name")?,
            job_type: JobType::from_str(&job_type)
                .ok_or_else(|| Self::conversion_error(3, &job_type))?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| Self::conversion_error(4, &status))?,
            priority: JobPriority::from_i32(priority)
                .ok_or_else(|| Self::conversion_error(5, &priority.to_string()))?,
            owner_user_id: row.get("owner_user_id")?,
            worker_id: row.get("worker_id")?,
            queue_name: row.get("queue_name")?,
            progress: row.get("progress")?,
            current_step: row.get("current_step")?,
            total_steps: row.get("total_steps")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
            estimated_duration: row.get("estimated_duration")?,
            parameters: Payload::from_bytes(row.get("parameters")?),
            result: row
                .get::<_, Option<Vec<u8>>>("result")?
                .map(Payload::from_bytes),
            error_info: row
                .get::<_, Option<Vec<u8>>>("error_info")?
                .map(Payload::from_bytes),
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            retry_delay: row.get("retry_delay")?,
            message: row.get("message")?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            is_critical: row.get("is_critical")?,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> JobResult<Option<JobRecord>> {
        Ok(conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                [id],
                Self::row_to_record,
            )
            .optional()?)
    }

    /// Builds the WHERE clause shared by listing and counting.
    fn where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        fn in_set(
            column: &str,
            items: Vec<Box<dyn ToSql>>,
            conditions: &mut Vec<String>,
            values: &mut Vec<Box<dyn ToSql>>,
        ) {
            if items.is_empty() {
                return;
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            conditions.push(format!("{} IN ({})", column, placeholders));
            values.extend(items);
        }

        in_set(
            "status",
            filter
                .statuses
                .iter()
                .map(|s| Box::new(s.as_str()) as Box<dyn ToSql>)
                .collect(),
            &mut conditions,
            &mut values,
        );
        in_set(
            "job_type",
            filter
                .types
                .iter()
                .map(|t| Box::new(t.as_str()) as Box<dyn ToSql>)
                .collect(),
            &mut conditions,
            &mut values,
        );
        in_set(
            "priority",
            filter
                .priorities
                .iter()
                .map(|p| Box::new(p.as_i32()) as Box<dyn ToSql>)
                .collect(),
            &mut conditions,
            &mut values,
        );

        if let Some(owner) = &filter.owner_user_id {
            conditions.push("owner_user_id = ?".to_string());
            values.push(Box::new(owner.clone()));
        }
        if let Some(queue) = &filter.queue_name {
            conditions.push("queue_name = ?".to_string());
            values.push(Box::new(queue.clone()));
        }
        if let Some(is_critical) = filter.is_critical {
            conditions.push("is_critical = ?".to_string());
            values.push(Box::new(is_critical));
        }
        if let Some(after) = filter.created_after {
            conditions.push("created_at >= ?".to_string());
            values.push(Box::new(after));
        }
        if let Some(before) = filter.created_before {
            conditions.push("created_at < ?".to_string());
            values.push(Box::new(before));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }

    fn scope_clause(owner_user_id: Option<&str>, since: Option<i64>) -> (String, Vec<Box<dyn ToSql>>) {
        let filter = JobFilter {
            owner_user_id: owner_user_id.map(str::to_string),
            created_after: since,
            ..Default::default()
        };
        Self::where_clause(&filter)
    }

    fn grouped_counts(
        conn: &Connection,
        column: &str,
        where_sql: &str,
        values: &[&dyn ToSql],
    ) -> JobResult<Vec<(rusqlite::types::Value, usize)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {col}, COUNT(*) FROM jobs{w} GROUP BY {col}",
            col = column,
            w = where_sql
        ))?;
        let rows = stmt
            .query_map(values, |row| {
                Ok((
                    row.get::<_, rusqlite::types::Value>(0)?,
                    row.get::<_, i64>(1)? as usize,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: NewJob) -> JobResult<JobRecord> {
        let now = Self::now();
        let record = JobRecord {
            id: job.id,
            external_job_id: job.external_job_id,
            name: job.name,
            job_type: job.job_type,
            status: JobStatus::Pending,
            priority: job.priority,
            owner_user_id: job.owner_user_id,
            worker_id: None,
            queue_name: job.queue_name,
            progress: 0,
            current_step: None,
            total_steps: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            estimated_duration: job.estimated_duration,
            parameters: job.parameters,
            result: None,
            error_info: None,
            retry_count: 0,
            max_retries: job.max_retries,
            retry_delay: job.retry_delay,
            message: None,
            tags: job.tags,
            is_critical: job.is_critical,
        };
        let tags = serde_json::to_string(&record.tags).map_err(anyhow::Error::from)?;

        let conn = self.lock()?;
        let inserted = conn.execute(
            r#"INSERT INTO jobs (
                id, external_job_id, name, job_type, status, priority, owner_user_id,
                worker_id, queue_name, progress, current_step, total_steps,
                created_at, started_at, completed_at, updated_at, estimated_duration,
                parameters, result, error_info, retry_count, max_retries, retry_delay,
                message, tags, is_critical
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
            )"#,
            params![
                record.id,
                record.external_job_id,
                record.name,
                record.job_type.as_str(),
                record.status.as_str(),
                record.priority.as_i32(),
                record.owner_user_id,
                record.worker_id,
                record.queue_name,
                record.progress,
                record.current_step,
                record.total_steps,
                record.created_at,
                record.started_at,
                record.completed_at,
                record.updated_at,
                record.estimated_duration,
                record.parameters.as_bytes(),
                record.result.as_ref().map(|p| p.as_bytes()),
                record.error_info.as_ref().map(|p| p.as_bytes()),
                record.retry_count,
                record.max_retries,
                record.retry_delay,
                record.message,
                tags,
                record.is_critical,
            ],
        );

        match inserted {
            Ok(_) => Ok(record),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(JobError::Validation(format!(
                    "a task with id {} or external id {} already exists",
                    record.id, record.external_job_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> JobResult<JobRecord> {
        let conn = self.lock()?;
        Self::fetch(&conn, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    fn find_by_external_id(&self, external_job_id: &str) -> JobResult<Option<JobRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT * FROM jobs WHERE external_job_id = ?1",
                [external_job_id],
                Self::row_to_record,
            )
            .optional()?)
    }

    fn update(&self, id: &str, patch: &JobPatch) -> JobResult<JobRecord> {
        let conn = self.lock()?;
        let current = Self::fetch(&conn, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;

        let mut next = current.clone();
        state_machine::apply_patch(&mut next, patch, Self::now())?;

        let changed = conn.execute(
            r#"UPDATE jobs SET
                status = ?1, progress = ?2, current_step = ?3, total_steps = ?4,
                started_at = ?5, completed_at = ?6, updated_at = ?7, worker_id = ?8,
                result = ?9, error_info = ?10, retry_count = ?11, message = ?12
               WHERE id = ?13 AND status = ?14 AND retry_count = ?15"#,
            params![
                next.status.as_str(),
                next.progress,
                next.current_step,
                next.total_steps,
                next.started_at,
                next.completed_at,
                next.updated_at,
                next.worker_id,
                next.result.as_ref().map(|p| p.as_bytes()),
                next.error_info.as_ref().map(|p| p.as_bytes()),
                next.retry_count,
                next.message,
                id,
                current.status.as_str(),
                current.retry_count,
            ],
        )?;

        if changed == 0 {
            return Err(JobError::InvalidState(
                "task was modified concurrently".to_string(),
            ));
        }
        Ok(next)
    }

    fn list(&self, filter: &JobFilter) -> JobResult<JobPage> {
        let (where_sql, values) = Self::where_clause(filter);
        let limit = filter.limit as i64;
        let offset = filter.offset as i64;
        let mut value_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs{}", where_sql),
            value_refs.as_slice(),
            |row| row.get(0),
        )?;

        value_refs.push(&limit);
        value_refs.push(&offset);

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM jobs{} ORDER BY {} {}, id ASC LIMIT ? OFFSET ?",
            where_sql,
            filter.order_by.as_sql(),
            filter.direction.as_sql()
        ))?;
        let items = stmt
            .query_map(value_refs.as_slice(), Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(JobPage {
            items,
            total: total as usize,
        })
    }

    fn aggregate(
        &self,
        owner_user_id: Option<&str>,
        since: Option<i64>,
    ) -> JobResult<JobAggregates> {
        let (where_sql, values) = Self::scope_clause(owner_user_id, since);
        let value_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let conn = self.lock()?;
        let text = |value: &rusqlite::types::Value| match value {
            rusqlite::types::Value::Text(s) => Some(s.clone()),
            _ => None,
        };

        let by_status = Self::grouped_counts(&conn, "status", &where_sql, &value_refs)?
            .into_iter()
            .filter_map(|(v, n)| text(&v).and_then(|s| JobStatus::from_str(&s)).map(|s| (s, n)))
            .collect();
        let by_type = Self::grouped_counts(&conn, "job_type", &where_sql, &value_refs)?
            .into_iter()
            .filter_map(|(v, n)| text(&v).and_then(|s| JobType::from_str(&s)).map(|t| (t, n)))
            .collect();
        let by_priority = Self::grouped_counts(&conn, "priority", &where_sql, &value_refs)?
            .into_iter()
            .filter_map(|(v, n)| match v {
                rusqlite::types::Value::Integer(i) => {
                    JobPriority::from_i32(i as i32).map(|p| (p, n))
                }
                _ => None,
            })
            .collect();

        let duration_condition = "started_at IS NOT NULL AND completed_at IS NOT NULL";
        let duration_where = if where_sql.is_empty() {
            format!(" WHERE {}", duration_condition)
        } else {
            format!("{} AND {}", where_sql, duration_condition)
        };
        let average_duration: Option<f64> = conn.query_row(
            &format!(
                "SELECT AVG(completed_at - started_at) FROM jobs{}",
                duration_where
            ),
            value_refs.as_slice(),
            |row| row.get(0),
        )?;

        Ok(JobAggregates {
            by_status,
            by_type,
            by_priority,
            average_duration,
        })
    }

    fn list_unfinished(&self) -> JobResult<Vec<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM jobs
               WHERE status IN ('PENDING', 'PROGRESS', 'RETRY')
               ORDER BY created_at ASC, id ASC"#,
        )?;
        let items = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn purge_terminal_before(&self, cutoff: i64) -> JobResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            r#"DELETE FROM jobs
               WHERE completed_at IS NOT NULL AND completed_at < ?1
                 AND (status IN ('SUCCESS', 'REVOKED')
                      OR (status = 'FAILURE' AND retry_count >= max_retries))"#,
            [cutoff],
        )?;
        Ok(deleted)
    }
}
