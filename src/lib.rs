// Re-export modules
pub mod config;
pub mod crawlers;
pub mod error;
pub mod jobs;
pub mod limiter;
pub mod parsers;
pub mod performance;
pub mod recovery;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use config::{CrawlMode, CrawlRequest, EngineConfig, ModeOptions};
pub use error::{Error, Result};
pub use results::CrawlResult;

use crawlers::{CrawlExecutor, HttpPolicySource, PolicySource, RenderingBackend, WebDriverBackend};
use limiter::RateLimiter;
use performance::{PerformanceTracker, SpanStatistics};
use recovery::ErrorRecoveryManager;
use results::ResultOrigin;
use runner::CrawlRunner;
use scheduler::{Clock, JobScheduler, SystemClock};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{JobStore, JsonFileJobStore, MemoryStore, ResultStore, WorkUnitStore};

/// What one maintenance pass cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub slow_spans: usize,
    pub evicted_spans: usize,
    pub purged_clients: usize,
    pub purged_units: usize,
}

/// Builder wiring the engine's components together
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn RenderingBackend>>,
    policy: Option<Arc<dyn PolicySource>>,
    jobs: Option<Arc<dyn JobStore>>,
    results: Option<Arc<dyn ResultStore>>,
    units: Option<Arc<dyn WorkUnitStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Replace the WebDriver rendering backend
    pub fn with_backend(mut self, backend: Arc<dyn RenderingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the HTTP robots.txt source
    pub fn with_policy_source(mut self, policy: Arc<dyn PolicySource>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Use this job store instead of the configured file or memory store
    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_unit_store(mut self, units: Arc<dyn WorkUnitStore>) -> Self {
        self.units = Some(units);
        self
    }

    /// Clock the scheduler computes fire times from
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and construct every component
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let backend = self.backend.unwrap_or_else(|| {
            Arc::new(WebDriverBackend::new(config.webdriver_url.clone())) as Arc<dyn RenderingBackend>
        });
        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(HttpPolicySource::new(config.policy_timeout())) as Arc<dyn PolicySource>
        });

        let memory = Arc::new(MemoryStore::new());
        let jobs: Arc<dyn JobStore> = match (self.jobs, &config.job_store_path) {
            (Some(jobs), _) => jobs,
            (None, Some(path)) => Arc::new(JsonFileJobStore::open(path).await?),
            (None, None) => memory.clone(),
        };
        let results = self
            .results
            .unwrap_or_else(|| memory.clone() as Arc<dyn ResultStore>);
        let units = self
            .units
            .unwrap_or_else(|| memory.clone() as Arc<dyn WorkUnitStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let performance = Arc::new(PerformanceTracker::new());
        let executor = Arc::new(CrawlExecutor::new(backend, policy, &config));
        let recovery = Arc::new(ErrorRecoveryManager::new(
            config.recovery.clone(),
            units.clone(),
        ));
        let runner = Arc::new(CrawlRunner::new(
            executor,
            recovery,
            units.clone(),
            results,
            performance.clone(),
        ));
        let scheduler =
            JobScheduler::new(jobs, runner.clone(), clock, config.scheduled_failure_policy);

        ::log::info!(
            "Engine ready (webdriver: {}, {} requests/min, failure policy: {:?})",
            config.webdriver_url,
            config.requests_per_minute,
            config.scheduled_failure_policy
        );
        Ok(Engine {
            limiter: RateLimiter::new(config.requests_per_minute),
            config,
            performance,
            runner,
            scheduler,
            units,
        })
    }
}

/// The crawl engine: immediate crawls, scheduled jobs and their bookkeeping
pub struct Engine {
    config: EngineConfig,
    limiter: RateLimiter,
    performance: Arc<PerformanceTracker>,
    runner: Arc<CrawlRunner>,
    scheduler: JobScheduler,
    units: Arc<dyn WorkUnitStore>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            backend: None,
            policy: None,
            jobs: None,
            results: None,
            units: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rate-limited crawl with retries; the result is stored before it is returned
    pub async fn crawl_now(
        &self,
        client_id: &str,
        owner_id: &str,
        request: CrawlRequest,
    ) -> Result<CrawlResult> {
        self.limiter.check_and_admit(client_id)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let context = serde_json::json!({
            "client_id": client_id,
            "owner_id": owner_id,
            "url": request.url.as_str(),
            "mode": request.mode().as_str(),
        });
        let result = self
            .runner
            .run_with_recovery(&request_id, &request, Some(context))
            .await?;
        self.runner
            .store_result(ResultOrigin::Request(request_id), owner_id, result.clone())
            .await;
        Ok(result)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.performance
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn statistics(&self) -> BTreeMap<String, SpanStatistics> {
        self.performance.all_statistics()
    }

    /// Report slow spans, drop old spans and finished units, forget idle limiter clients
    pub async fn maintain(&self) -> MaintenanceReport {
        let cutoff =
            Utc::now() - chrono::Duration::hours(self.config.metrics_max_age_hours as i64);
        let purged_units = match self.units.purge_terminal_before(cutoff).await {
            Ok(purged) => purged,
            Err(e) => {
                ::log::warn!("Failed to purge finished work units: {}", e);
                0
            }
        };
        let report = MaintenanceReport {
            slow_spans: self
                .performance
                .log_slow(self.config.slow_span_threshold_secs)
                .len(),
            evicted_spans: self
                .performance
                .evict_older_than(self.config.metrics_max_age_hours),
            purged_clients: self.limiter.purge_idle(),
            purged_units,
        };
        ::log::debug!("Maintenance: {:?}", report);
        report
    }

    /// Stop the scheduler and release the rendering session
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await?;
        ::log::info!("Final performance statistics: {:?}", self.statistics());
        Ok(())
    }
}
