use crate::config::{CrawlMode, CrawlRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the most recent run of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Never run
    #[default]
    Idle,
    Running,
    /// Waiting for a bounded retry
    Retrying,
    Completed,
    Error,
}

/// A recurring crawl definition bound to a cron schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub request: CrawlRequest,
    /// 5-field crontab expression
    pub schedule: String,
    pub enabled: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        request: CrawlRequest,
        schedule: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            request,
            schedule: schedule.into(),
            enabled: true,
            status: JobStatus::Idle,
            last_run: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mode(&self) -> CrawlMode {
        self.request.mode()
    }
}

/// Fields written together when configuration changes
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfigUpdate {
    pub request: CrawlRequest,
    pub schedule: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Fields written together when a run finishes or changes state
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunUpdate {
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRunUpdate {
    pub fn succeeded(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Completed,
            last_run: Some(at),
            last_error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            last_run: Some(at),
            last_error: Some(error.into()),
        }
    }
}
