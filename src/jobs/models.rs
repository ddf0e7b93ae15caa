//! Data models for job records.
//!
//! Defines job statuses, types, priorities, the persisted record and the
//! filter/patch shapes used to query and mutate it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Progress,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Progress,
        JobStatus::Success,
        JobStatus::Failure,
        JobStatus::Retry,
        JobStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Progress => "PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Retry => "RETRY",
            JobStatus::Revoked => "REVOKED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROGRESS" => Some(JobStatus::Progress),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILURE" => Some(JobStatus::Failure),
            "RETRY" => Some(JobStatus::Retry),
            "REVOKED" => Some(JobStatus::Revoked),
            _ => None,
        }
    }

    /// SUCCESS and REVOKED never change again. FAILURE is only final once
    /// retries are exhausted, see [`JobRecord::is_terminal`].
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Revoked)
    }

    /// Work is queued or running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Progress | JobStatus::Retry
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a job performs. Each type maps to exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Ocr,
    Llm,
    KgExtraction,
    FileProcessing,
    Export,
    Import,
    HealthCheck,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::Ocr,
        JobType::Llm,
        JobType::KgExtraction,
        JobType::FileProcessing,
        JobType::Export,
        JobType::Import,
        JobType::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ocr => "OCR",
            JobType::Llm => "LLM",
            JobType::KgExtraction => "KG_EXTRACTION",
            JobType::FileProcessing => "FILE_PROCESSING",
            JobType::Export => "EXPORT",
            JobType::Import => "IMPORT",
            JobType::HealthCheck => "HEALTH_CHECK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OCR" => Some(JobType::Ocr),
            "LLM" => Some(JobType::Llm),
            "KG_EXTRACTION" => Some(JobType::KgExtraction),
            "FILE_PROCESSING" => Some(JobType::FileProcessing),
            "EXPORT" => Some(JobType::Export),
            "IMPORT" => Some(JobType::Import),
            "HEALTH_CHECK" => Some(JobType::HealthCheck),
            _ => None,
        }
    }

    /// Name under which the handler for this type is dispatched.
    pub fn handler_name(&self) -> &'static str {
        match self {
            JobType::Ocr => "documents.ocr",
            JobType::Llm => "llm.generate",
            JobType::KgExtraction => "kg.extract",
            JobType::FileProcessing => "files.process",
            JobType::Export => "data.export",
            JobType::Import => "data.import",
            JobType::HealthCheck => "system.health_check",
        }
    }

    pub fn default_queue(&self) -> &'static str {
        match self {
            JobType::Ocr => "ocr",
            JobType::Llm => "llm",
            JobType::KgExtraction => "kg",
            _ => "default",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobType::Ocr => "Document OCR",
            JobType::Llm => "LLM generation",
            JobType::KgExtraction => "Knowledge graph extraction",
            JobType::FileProcessing => "File processing",
            JobType::Export => "Export",
            JobType::Import => "Import",
            JobType::HealthCheck => "Health check",
        }
    }
}

/// Scheduling priority. Stored as an integer so it sorts naturally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Critical,
    ];

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(JobPriority::Low),
            1 => Some(JobPriority::Normal),
            2 => Some(JobPriority::High),
            3 => Some(JobPriority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            "critical" => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

/// Opaque job data, kept as serialized JSON bytes.
///
/// Handlers decode it into their own parameter/result types; nothing else
/// looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_vec(value).map(Payload)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.0)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON rendering for the wire. Empty or undecodable payloads render as null.
    pub fn to_json(&self) -> serde_json::Value {
        if self.0.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_slice(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        // Serializing a Value cannot fail.
        Payload(serde_json::to_vec(&value).unwrap_or_default())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Payload::from)
    }
}

/// A persisted job. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub external_job_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub owner_user_id: String,
    pub worker_id: Option<String>,
    pub queue_name: String,
    pub progress: u8,
    pub current_step: Option<i64>,
    pub total_steps: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub estimated_duration: Option<i64>,
    pub parameters: Payload,
    pub result: Option<Payload>,
    pub error_info: Option<Payload>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay: i64,
    pub message: Option<String>,
    pub tags: Vec<String>,
    pub is_critical: bool,
}

impl JobRecord {
    /// Seconds between the first PROGRESS and the terminal transition.
    pub fn actual_duration(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// True once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        self.status.is_final() || (self.status == JobStatus::Failure && self.retries_exhausted())
    }

    pub fn is_manageable_by(&self, actor: &Actor) -> bool {
        actor.is_admin || actor.user_id == self.owner_user_id
    }
}

/// Who is acting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }
}

/// Everything needed to insert a PENDING record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub external_job_id: String,
    pub name: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub owner_user_id: String,
    pub queue_name: String,
    pub parameters: Payload,
    pub estimated_duration: Option<i64>,
    pub max_retries: u32,
    pub retry_delay: i64,
    pub tags: Vec<String>,
    pub is_critical: bool,
}

/// Partial update applied by [`super::JobStore::update`].
///
/// `None` leaves a field untouched. `expected_status` makes the update
/// conditional on the status observed by the caller.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub expected_status: Option<JobStatus>,
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<i64>,
    pub total_steps: Option<i64>,
    pub message: Option<String>,
    pub worker_id: Option<Option<String>>,
    pub result: Option<Payload>,
    pub error_info: Option<Payload>,
    pub retry_count: Option<u32>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    Status,
    Progress,
    Name,
}

impl SortColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortColumn::CreatedAt => "created_at",
            SortColumn::UpdatedAt => "updated_at",
            SortColumn::Priority => "priority",
            SortColumn::Status => "status",
            SortColumn::Progress => "progress",
            SortColumn::Name => "name",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created_at" => Some(SortColumn::CreatedAt),
            "updated_at" => Some(SortColumn::UpdatedAt),
            "priority" => Some(SortColumn::Priority),
            "status" => Some(SortColumn::Status),
            "progress" => Some(SortColumn::Progress),
            "name" => Some(SortColumn::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Filter for listing jobs. Empty sets match everything.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub types: Vec<JobType>,
    pub priorities: Vec<JobPriority>,
    pub owner_user_id: Option<String>,
    pub queue_name: Option<String>,
    pub is_critical: Option<bool>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub order_by: SortColumn,
    pub direction: SortDirection,
    pub offset: usize,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            types: Vec::new(),
            priorities: Vec::new(),
            owner_user_id: None,
            queue_name: None,
            is_critical: None,
            created_after: None,
            created_before: None,
            order_by: SortColumn::default(),
            direction: SortDirection::default(),
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of a listing plus the full match count.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub items: Vec<JobRecord>,
    pub total: usize,
}

/// Raw grouped counts, as read from the store.
#[derive(Debug, Clone, Default)]
pub struct JobAggregates {
    pub by_status: Vec<(JobStatus, usize)>,
    pub by_type: Vec<(JobType, usize)>,
    pub by_priority: Vec<(JobPriority, usize)>,
    pub average_duration: Option<f64>,
}
