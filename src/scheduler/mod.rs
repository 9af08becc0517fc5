//! Cron-driven recurring crawls.
//!
//! Every enabled job owns one trigger task that sleeps until the job's next
//! fire time and then hands the run to a [`TaskTracker`], so stopping the
//! scheduler can cancel the triggers and still wait for runs in flight.

mod clock;
mod cron;


pub use clock::{Clock, PausedClock, SystemClock};
pub use cron::CronSchedule;

use crate::config::{CrawlRequest, ScheduledFailurePolicy};
use crate::error::{Error, Result};
use crate::jobs::{Job, JobConfigUpdate, JobRunUpdate, JobStatus};
use crate::results::{CrawlResult, ResultOrigin};
use crate::runner::CrawlRunner;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// How long `stop` waits for in-flight runs
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

struct Trigger {
    schedule: CronSchedule,
    handle: JoinHandle<()>,
}

/// State shared with trigger tasks and runs
struct Shared {
    jobs: Arc<dyn JobStore>,
    runner: Arc<CrawlRunner>,
    clock: Arc<dyn Clock>,
    failure_policy: ScheduledFailurePolicy,
    tracker: TaskTracker,
    in_flight: Mutex<HashSet<String>>,
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    state: Mutex<SchedulerState>,
    triggers: Mutex<HashMap<String, Trigger>>,
    drain_timeout: Duration,
}

impl JobScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        runner: Arc<CrawlRunner>,
        clock: Arc<dyn Clock>,
        failure_policy: ScheduledFailurePolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs,
                runner,
                clock,
                failure_policy,
                tracker: TaskTracker::new(),
                in_flight: Mutex::new(HashSet::new()),
            }),
            state: Mutex::new(SchedulerState::Idle),
            triggers: Mutex::new(HashMap::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn failure_policy(&self) -> ScheduledFailurePolicy {
        self.shared.failure_policy
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.state) == SchedulerState::Running
    }

    /// Persist a new job (replacing any record with the same id) and
    /// register it when the scheduler is running
    pub async fn add_job(
        &self,
        id: &str,
        owner_id: &str,
        request: CrawlRequest,
        cron: &str,
    ) -> Result<Job> {
        let schedule = CronSchedule::parse(cron)?;
        let job = Job::new(id, owner_id, request, schedule.expression());
        self.shared.jobs.insert(&job).await?;
        ::log::info!("Added job {} with schedule {}", id, schedule);

        if self.is_running() {
            self.register(id, schedule);
        }
        Ok(job)
    }

    /// Replace a job's request, schedule and enabled flag
    pub async fn update_job(
        &self,
        id: &str,
        request: CrawlRequest,
        cron: &str,
        enabled: bool,
    ) -> Result<Job> {
        let schedule = CronSchedule::parse(cron)?;
        let update = JobConfigUpdate {
            request,
            schedule: schedule.expression().to_string(),
            enabled,
            updated_at: Utc::now(),
        };
        let job = self.shared.jobs.update_config(id, update).await?;

        if enabled && self.is_running() {
            self.register(id, schedule);
        } else {
            self.deregister(id);
        }
        ::log::info!("Updated job {} (enabled: {})", id, enabled);
        Ok(job)
    }

    /// Deregister and delete; returns whether a record existed
    pub async fn remove_job(&self, id: &str) -> Result<bool> {
        self.deregister(id);
        let removed = self.shared.jobs.delete(id).await?;
        if removed {
            ::log::info!("Removed job {}", id);
        }
        Ok(removed)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.shared.jobs.list().await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.shared.jobs.get(id).await
    }

    /// Activate triggers and restore every enabled job from the store
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                SchedulerState::Running => return Ok(()),
                SchedulerState::Stopped => {
                    return Err(Error::Validation("scheduler has been stopped".into()));
                }
                SchedulerState::Idle => *state = SchedulerState::Running,
            }
        }
        ::log::info!("Scheduler started");

        let jobs = self.shared.jobs.list_enabled().await?;
        let mut restored = 0;
        for job in jobs {
            match CronSchedule::parse(&job.schedule) {
                Ok(schedule) => {
                    self.register(&job.id, schedule);
                    restored += 1;
                }
                Err(e) => ::log::error!("Error restoring job {}: {}", job.id, e),
            }
        }
        ::log::info!("Restored {} scheduled jobs", restored);
        Ok(())
    }

    /// Cancel triggers, wait for in-flight runs, then close the rendering session
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == SchedulerState::Stopped {
                return Ok(());
            }
            *state = SchedulerState::Stopped;
        }

        let triggers: Vec<Trigger> = lock(&self.triggers).drain().map(|(_, t)| t).collect();
        for trigger in &triggers {
            trigger.handle.abort();
        }

        self.shared.tracker.close();
        if tokio::time::timeout(self.drain_timeout, self.shared.tracker.wait())
            .await
            .is_err()
        {
            ::log::warn!(
                "{} scheduled runs still in flight after {}s",
                self.shared.tracker.len(),
                self.drain_timeout.as_secs()
            );
        }

        self.shared.runner.executor().close().await?;
        ::log::info!("Scheduler stopped");
        Ok(())
    }

    /// Run a job immediately, outside its schedule
    pub async fn run_now(&self, id: &str) -> Result<CrawlResult> {
        let job = self
            .shared
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("job", id))?;
        let fired_at = self.shared.clock.now();
        self.shared.run_job(job, fired_at).await
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.triggers).contains_key(id)
    }

    pub fn registered_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.triggers).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// When the job's trigger fires next
    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        let triggers = lock(&self.triggers);
        let trigger = triggers.get(id)?;
        trigger.schedule.next_after(self.shared.clock.now())
    }

    fn register(&self, id: &str, schedule: CronSchedule) {
        let handle = tokio::spawn(trigger_loop(
            self.shared.clone(),
            id.to_string(),
            schedule.clone(),
        ));
        let previous = lock(&self.triggers).insert(id.to_string(), Trigger { schedule, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
            ::log::debug!("Replaced trigger for job {}", id);
        }
        ::log::info!("Registered job {}", id);
    }

    fn deregister(&self, id: &str) {
        if let Some(trigger) = lock(&self.triggers).remove(id) {
            trigger.handle.abort();
            ::log::info!("Deregistered job {}", id);
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for (_, trigger) in lock(&self.triggers).drain() {
            trigger.handle.abort();
        }
    }
}

async fn trigger_loop(shared: Arc<Shared>, job_id: String, schedule: CronSchedule) {
    loop {
        let Some(fire_at) = schedule.next_after(shared.clock.now()) else {
            ::log::warn!("Schedule `{}` of job {} never fires", schedule, job_id);
            return;
        };
        shared.sleep_until(fire_at).await;

        let run_shared = shared.clone();
        let id = job_id.clone();
        shared.tracker.spawn(async move {
            run_shared.fire(&id, fire_at).await;
        });
    }
}

impl Shared {
    async fn sleep_until(&self, at: DateTime<Utc>) {
        loop {
            let now = self.clock.now();
            if now >= at {
                return;
            }
            let wait = (at - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
    }

    async fn fire(&self, job_id: &str, fired_at: DateTime<Utc>) {
        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) if job.enabled => job,
            Ok(Some(_)) => {
                ::log::debug!("Job {} is disabled, skipping tick", job_id);
                return;
            }
            Ok(None) => {
                ::log::warn!("Job {} fired but no longer exists", job_id);
                return;
            }
            Err(e) => {
                ::log::error!("Failed to load job {}: {}", job_id, e);
                return;
            }
        };
        if let Ok(result) = self.run_job(job, fired_at).await {
            ::log::info!(
                "Scheduled crawl {} finished with status {}",
                job_id,
                result.status_code
            );
        }
    }

    async fn run_job(&self, job: Job, fired_at: DateTime<Utc>) -> Result<CrawlResult> {
        let Some(_guard) = InFlight::enter(&self.in_flight, &job.id) else {
            ::log::warn!("Job {} is still running, skipping this tick", job.id);
            return Err(Error::Validation(format!("job {} is already running", job.id)));
        };

        ::log::info!("Executing scheduled crawl {}", job.id);
        self.record(
            &job.id,
            JobRunUpdate {
                status: JobStatus::Running,
                last_run: None,
                last_error: job.last_error.clone(),
            },
        )
        .await;

        let outcome = match self.failure_policy {
            ScheduledFailurePolicy::NextTick => self.runner.attempt(&job.id, &job.request).await,
            ScheduledFailurePolicy::BoundedRetry => {
                let unit_id = run_unit_id(&job.id, fired_at);
                let context = serde_json::json!({
                    "job_id": job.id,
                    "owner_id": job.owner_id,
                    "schedule": job.schedule,
                });
                let jobs = self.jobs.clone();
                let id = job.id.clone();
                self.runner
                    .run_with_recovery_notify(&unit_id, &job.request, Some(context), move |notice| {
                        let jobs = jobs.clone();
                        let id = id.clone();
                        async move {
                            let update = JobRunUpdate {
                                status: JobStatus::Retrying,
                                last_run: None,
                                last_error: Some(notice.error),
                            };
                            if let Err(e) = jobs.record_run(&id, update).await {
                                ::log::error!("Failed to record retry of job {}: {}", id, e);
                            }
                        }
                    })
                    .await
            }
        };

        let finished = self.clock.now();
        match &outcome {
            Ok(result) => {
                self.runner
                    .store_result(ResultOrigin::Job(job.id.clone()), &job.owner_id, result.clone())
                    .await;
                self.record(&job.id, JobRunUpdate::succeeded(finished)).await;
            }
            Err(e) => {
                ::log::error!("Scheduled crawl {} failed: {}", job.id, e);
                self.record(&job.id, JobRunUpdate::failed(finished, e.to_string()))
                    .await;
            }
        }
        outcome
    }

    async fn record(&self, job_id: &str, update: JobRunUpdate) {
        if let Err(e) = self.jobs.record_run(job_id, update).await {
            ::log::error!("Failed to record run of job {}: {}", job_id, e);
        }
    }
}

/// Unit-of-work id for one scheduled run
pub(crate) fn run_unit_id(job_id: &str, fired_at: DateTime<Utc>) -> String {
    format!("job:{}:{}", job_id, fired_at.to_rfc3339())
}

/// Marks a job as running until dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        if !lock(set).insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
