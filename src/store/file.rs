use super::JobStore;
use super::memory::apply_run;
use crate::error::{Error, Result};
use crate::jobs::{Job, JobConfigUpdate, JobRunUpdate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Job store persisted as a JSON array on disk
///
/// Every mutation rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileJobStore {
    path: PathBuf,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl JsonFileJobStore {
    /// Open the store, loading existing jobs if the file exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let jobs = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => {
                let list: Vec<Job> = serde_json::from_str(&contents).map_err(|e| {
                    Error::Persistence(format!("corrupt job store {}: {}", path.display(), e))
                })?;
                list.into_iter().map(|job| (job.id.clone(), job)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        ::log::info!("Loaded {} jobs from {}", jobs.len(), path.display());
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, jobs: &BTreeMap<String, Job>) -> Result<()> {
        let list: Vec<&Job> = jobs.values().collect();
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::Persistence(format!("failed to encode jobs: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        ::log::trace!("Wrote {} jobs to {}", list.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let previous = jobs.insert(job.id.clone(), job.clone());
        if let Err(e) = self.flush(&jobs).await {
            // Keep memory consistent with what is on disk
            match previous {
                Some(previous) => jobs.insert(job.id.clone(), previous),
                None => jobs.remove(&job.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn update_config(&self, id: &str, update: JobConfigUpdate) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let previous = jobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", id))?;

        let mut job = previous.clone();
        job.request = update.request;
        job.schedule = update.schedule;
        job.enabled = update.enabled;
        job.updated_at = update.updated_at;
        jobs.insert(id.to_string(), job.clone());

        if let Err(e) = self.flush(&jobs).await {
            jobs.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(job)
    }

    async fn record_run(&self, id: &str, update: JobRunUpdate) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let previous = jobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", id))?;

        let mut job = previous.clone();
        apply_run(&mut job, update);
        jobs.insert(id.to_string(), job);

        if let Err(e) = self.flush(&jobs).await {
            jobs.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(previous) = jobs.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&jobs).await {
            jobs.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }
}
