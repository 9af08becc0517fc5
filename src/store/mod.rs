//! Storage seams for jobs, results and units of work.

mod file;
mod memory;

pub use file::JsonFileJobStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::jobs::{Job, JobConfigUpdate, JobRunUpdate};
use crate::recovery::WorkUnit;
use crate::results::StoredResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record
    async fn insert(&self, job: &Job) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Job>>;
    async fn list(&self) -> Result<Vec<Job>>;

    async fn list_enabled(&self) -> Result<Vec<Job>> {
        Ok(self.list().await?.into_iter().filter(|j| j.enabled).collect())
    }

    /// Atomically replace request, schedule, enabled flag and `updated_at`
    async fn update_config(&self, id: &str, update: JobConfigUpdate) -> Result<Job>;

    /// Atomically write status, `last_run` and `last_error`
    async fn record_run(&self, id: &str, update: JobRunUpdate) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Append-only sink for crawl results
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn append(&self, result: StoredResult) -> Result<()>;
    async fn results(&self) -> Result<Vec<StoredResult>>;
}

#[async_trait]
pub trait WorkUnitStore: Send + Sync {
    async fn create(&self, unit: &WorkUnit) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<WorkUnit>>;
    /// Persist status, steps and `updated_at` in one write
    async fn save(&self, unit: &WorkUnit) -> Result<()>;

    /// Drop completed or failed units last updated before `cutoff`; returns how many were removed
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
