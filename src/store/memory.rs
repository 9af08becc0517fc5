use super::{JobStore, ResultStore, WorkUnitStore};
use crate::error::{Error, Result};
use crate::jobs::{Job, JobConfigUpdate, JobRunUpdate};
use crate::recovery::WorkUnit;
use crate::results::StoredResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Process-local store implementing every storage seam
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<String, Job>>,
    results: Mutex<Vec<StoredResult>>,
    units: Mutex<HashMap<String, WorkUnit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously persisted jobs
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        let store = Self::new();
        {
            let mut map = lock(&store.jobs);
            for job in jobs {
                map.insert(job.id.clone(), job);
            }
        }
        store
    }

    pub fn job_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn result_count(&self) -> usize {
        lock(&self.results).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        lock(&self.jobs).insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(lock(&self.jobs).values().cloned().collect())
    }

    async fn update_config(&self, id: &str, update: JobConfigUpdate) -> Result<Job> {
        let mut jobs = lock(&self.jobs);
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("job", id))?;
        job.request = update.request;
        job.schedule = update.schedule;
        job.enabled = update.enabled;
        job.updated_at = update.updated_at;
        Ok(job.clone())
    }

    async fn record_run(&self, id: &str, update: JobRunUpdate) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("job", id))?;
        apply_run(job, update);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.jobs).remove(id).is_some())
    }
}

pub(super) fn apply_run(job: &mut Job, update: JobRunUpdate) {
    job.status = update.status;
    if update.last_run.is_some() {
        job.last_run = update.last_run;
    }
    job.last_error = update.last_error;
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append(&self, result: StoredResult) -> Result<()> {
        lock(&self.results).push(result);
        Ok(())
    }

    async fn results(&self) -> Result<Vec<StoredResult>> {
        Ok(lock(&self.results).clone())
    }
}

#[async_trait]
impl WorkUnitStore for MemoryStore {
    async fn create(&self, unit: &WorkUnit) -> Result<()> {
        let mut units = lock(&self.units);
        if units.contains_key(&unit.id) {
            return Err(Error::Persistence(format!(
                "unit {} already exists",
                unit.id
            )));
        }
        units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkUnit>> {
        Ok(lock(&self.units).get(id).cloned())
    }

    async fn save(&self, unit: &WorkUnit) -> Result<()> {
        let mut units = lock(&self.units);
        if !units.contains_key(&unit.id) {
            return Err(Error::not_found("unit", unit.id.clone()));
        }
        units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut units = lock(&self.units);
        let before = units.len();
        units.retain(|_, unit| !(unit.status.is_terminal() && unit.updated_at < cutoff));
        Ok(before - units.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrawlRequest, ModeOptions};
    use crate::jobs::JobStatus;
    use crate::recovery::UnitStatus;

    fn job(id: &str, enabled: bool) -> Job {
        let request = CrawlRequest::parse("https://example.com/", ModeOptions::default()).unwrap();
        let mut job = Job::new(id, "owner", request, "*/5 * * * *");
        job.enabled = enabled;
        job
    }

    #[tokio::test]
    async fn test_list_enabled_filters_disabled_jobs() {
        let store = MemoryStore::with_jobs([job("a", true), job("b", false), job("c", true)]);
        let enabled: Vec<String> = store
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(enabled, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_record_run_keeps_last_run_when_unset() {
        let store = MemoryStore::with_jobs([job("a", true)]);
        let at = Utc::now();
        store
            .record_run("a", JobRunUpdate::failed(at, "timeout"))
            .await
            .unwrap();
        store
            .record_run(
                "a",
                JobRunUpdate {
                    status: JobStatus::Retrying,
                    last_run: None,
                    last_error: Some("timeout".into()),
                },
            )
            .await
            .unwrap();

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.last_run, Some(at));
    }

    #[tokio::test]
    async fn test_update_unknown_job_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .record_run("missing", JobRunUpdate::succeeded(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_units_must_be_created_before_saving() {
        let store = MemoryStore::new();
        let unit = WorkUnit::new("u1");
        assert!(store.save(&unit).await.is_err());
        store.create(&unit).await.unwrap();
        assert!(store.create(&unit).await.is_err());
        store.save(&unit).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_drops_only_old_terminal_units() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::hours(48);

        let mut completed = WorkUnit::new("completed");
        completed.status = UnitStatus::Completed;
        completed.updated_at = old;
        let mut failed = WorkUnit::new("failed");
        failed.status = UnitStatus::Error;
        failed.updated_at = old;
        let mut retrying = WorkUnit::new("retrying");
        retrying.status = UnitStatus::Retrying;
        retrying.updated_at = old;
        let mut recent = WorkUnit::new("recent");
        recent.status = UnitStatus::Completed;

        for unit in [&completed, &failed, &retrying, &recent] {
            store.create(unit).await.unwrap();
        }

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.purge_terminal_before(cutoff).await.unwrap(), 2);
        assert!(store.load("completed").await.unwrap().is_none());
        assert!(store.load("failed").await.unwrap().is_none());
        assert!(store.load("retrying").await.unwrap().is_some());
        assert!(store.load("recent").await.unwrap().is_some());
        assert_eq!(store.purge_terminal_before(cutoff).await.unwrap(), 0);
    }
}
