//! Database schema for jobs.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "external_job_id",
            &SqlType::Text,
            non_null = true,
            is_unique = true
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("owner_user_id", &SqlType::Text, non_null = true),
        sqlite_column!("worker_id", &SqlType::Text),
        sqlite_column!("queue_name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "progress",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("current_step", &SqlType::Integer),
        sqlite_column!("total_steps", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("estimated_duration", &SqlType::Integer),
        sqlite_column!("parameters", &SqlType::Blob, non_null = true),
        sqlite_column!("result", &SqlType::Blob),
        sqlite_column!("error_info", &SqlType::Blob),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_retries", &SqlType::Integer, non_null = true),
        sqlite_column!("retry_delay", &SqlType::Integer, non_null = true),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("tags", &SqlType::Text, non_null = true),
        sqlite_column!(
            "is_critical",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_jobs_status", "status"),
        ("idx_jobs_owner", "owner_user_id"),
        ("idx_jobs_type", "job_type"),
        ("idx_jobs_priority", "priority"),
        ("idx_jobs_queue", "queue_name"),
        ("idx_jobs_created_at", "created_at"),
        ("idx_jobs_critical", "is_critical"),
    ],
};

pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0],
    migration: None,
}];
