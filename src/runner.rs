use crate::config::CrawlRequest;
use crate::crawlers::CrawlExecutor;
use crate::error::Result;
use crate::performance::{Metadata, PerformanceTracker};
use crate::recovery::{ErrorRecoveryManager, RecoveryDecision, WorkUnit};
use crate::results::{CrawlResult, ResultOrigin, StoredResult};
use crate::store::{ResultStore, WorkUnitStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Emitted before each retry wait
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// 1-based retry number
    pub attempt: usize,
    pub delay: Duration,
    pub error: String,
}

/// Runs crawls as units of work: timing, retries and result storage
pub struct CrawlRunner {
    executor: Arc<CrawlExecutor>,
    recovery: Arc<ErrorRecoveryManager>,
    units: Arc<dyn WorkUnitStore>,
    results: Arc<dyn ResultStore>,
    performance: Arc<PerformanceTracker>,
}

impl CrawlRunner {
    pub fn new(
        executor: Arc<CrawlExecutor>,
        recovery: Arc<ErrorRecoveryManager>,
        units: Arc<dyn WorkUnitStore>,
        results: Arc<dyn ResultStore>,
        performance: Arc<PerformanceTracker>,
    ) -> Self {
        Self {
            executor,
            recovery,
            units,
            results,
            performance,
        }
    }

    pub fn executor(&self) -> &Arc<CrawlExecutor> {
        &self.executor
    }

    /// One executor call, timed as `crawl.<mode>`
    pub async fn attempt(&self, unit_label: &str, request: &CrawlRequest) -> Result<CrawlResult> {
        let mut metadata = Metadata::new();
        metadata.insert("url".into(), request.url.as_str().into());
        metadata.insert("unit".into(), unit_label.into());

        let span_name = format!("crawl.{}", request.mode());
        let span = self.performance.begin(&span_name, Some(metadata));
        let result = self.executor.crawl(request).await;
        if let Some(secs) = self.performance.end_span(span) {
            ::log::debug!("{} for {} took {:.2}s", span_name, unit_label, secs);
        }
        result
    }

    /// Attempt until success, a non-retryable error or the retry budget runs out
    pub async fn run_with_recovery(
        &self,
        unit_id: &str,
        request: &CrawlRequest,
        context: Option<serde_json::Value>,
    ) -> Result<CrawlResult> {
        self.run_with_recovery_notify(unit_id, request, context, |_| async {})
            .await
    }

    /// Like [`run_with_recovery`](Self::run_with_recovery), calling `on_retry`
    /// before each wait
    pub async fn run_with_recovery_notify<F, Fut>(
        &self,
        unit_id: &str,
        request: &CrawlRequest,
        context: Option<serde_json::Value>,
        mut on_retry: F,
    ) -> Result<CrawlResult>
    where
        F: FnMut(RetryNotice) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        self.units.create(&WorkUnit::new(unit_id)).await?;

        loop {
            let error = match self.attempt(unit_id, request).await {
                Ok(result) => {
                    self.recovery.mark_completed(unit_id).await;
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                self.recovery
                    .record_terminal(unit_id, &error, context.clone())
                    .await;
                return Err(error);
            }

            match self.recovery.recover(unit_id, &error, context.clone()).await {
                RecoveryDecision::Retry { attempt, delay } => {
                    ::log::info!(
                        "Retrying {} in {}s (attempt {}/{})",
                        unit_id,
                        delay.as_secs(),
                        attempt,
                        self.recovery.max_retries()
                    );
                    on_retry(RetryNotice {
                        attempt,
                        delay,
                        error: error.to_string(),
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                    self.recovery.mark_running(unit_id).await;
                }
                RecoveryDecision::GiveUp => {
                    ::log::error!("Giving up on {}: {}", unit_id, error);
                    return Err(error);
                }
            }
        }
    }

    /// Hand a result to the result store; failures are logged, not returned
    pub async fn store_result(
        &self,
        origin: ResultOrigin,
        owner_id: &str,
        result: CrawlResult,
    ) -> Option<String> {
        let stored = StoredResult::new(origin, owner_id, result);
        let id = stored.id.clone();
        match self.results.append(stored).await {
            Ok(()) => Some(id),
            Err(e) => {
                ::log::error!("Failed to store result {}: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ModeOptions};
    use crate::recovery::{StepType, UnitStatus};
    use crate::store::MemoryStore;
    use crate::testing::{FakeBackend, Navigation, StaticPolicy};
    use tokio::time::Instant;

    struct Harness {
        backend: FakeBackend,
        store: Arc<MemoryStore>,
        performance: Arc<PerformanceTracker>,
        runner: CrawlRunner,
    }

    fn harness(policy: StaticPolicy) -> Harness {
        let config = EngineConfig::default();
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryStore::new());
        let performance = Arc::new(PerformanceTracker::new());
        let executor = Arc::new(CrawlExecutor::new(
            Arc::new(backend.clone()),
            Arc::new(policy),
            &config,
        ));
        let recovery = Arc::new(ErrorRecoveryManager::new(
            config.recovery.clone(),
            store.clone(),
        ));
        let runner = CrawlRunner::new(
            executor,
            recovery,
            store.clone(),
            store.clone(),
            performance.clone(),
        );
        Harness {
            backend,
            store,
            performance,
            runner,
        }
    }

    fn request() -> CrawlRequest {
        CrawlRequest::parse("https://example.com/", ModeOptions::default()).unwrap()
    }

    async fn unit(store: &MemoryStore, id: &str) -> WorkUnit {
        store.load(id).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_spends_retry_budget() {
        let h = harness(StaticPolicy::allow_all());
        h.backend.push_navigations([Navigation::Status(503); 4]);

        let started = Instant::now();
        let err = h
            .runner
            .run_with_recovery("unit-1", &request(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch_error");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5 + 15 + 30));
        assert!(elapsed < Duration::from_secs(51));
        assert_eq!(h.backend.navigate_calls(), 4);

        let unit = unit(&h.store, "unit-1").await;
        assert_eq!(unit.status, UnitStatus::Error);
        let kinds: Vec<StepType> = unit.steps.iter().map(|s| s.step_type).collect();
        assert_eq!(
            kinds,
            vec![
                StepType::ErrorRecovery,
                StepType::ErrorRecovery,
                StepType::ErrorRecovery,
                StepType::ErrorFinal
            ]
        );
        let delays: Vec<Option<u64>> = unit.steps.iter().map(|s| s.delay).collect();
        assert_eq!(delays, vec![Some(5), Some(15), Some(30), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let h = harness(StaticPolicy::allow_all());
        h.backend
            .push_navigations([Navigation::BackendFailure, Navigation::Status(502)]);

        let mut notified = Vec::new();
        let result = h
            .runner
            .run_with_recovery_notify("unit-2", &request(), None, |notice| {
                notified.push((notice.attempt, notice.delay.as_secs()));
                async {}
            })
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(notified, vec![(1, 5), (2, 15)]);

        let unit = unit(&h.store, "unit-2").await;
        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!(unit.retry_count(), 2);
        assert_eq!(
            h.performance.statistics("crawl.headless").unwrap().count,
            3
        );
    }

    #[tokio::test]
    async fn test_policy_denial_is_terminal_without_retries() {
        let h = harness(StaticPolicy::new(Some("User-agent: *\nDisallow: /")));

        let err = h
            .runner
            .run_with_recovery("unit-3", &request(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "policy_denied");

        let unit = unit(&h.store, "unit-3").await;
        assert_eq!(unit.status, UnitStatus::Error);
        assert_eq!(unit.steps.len(), 1);
        assert_eq!(unit.steps[0].step_type, StepType::ErrorFinal);
        assert_eq!(unit.steps[0].error_details.kind, "policy_denied");
    }

    #[tokio::test]
    async fn test_duplicate_unit_id_is_rejected() {
        let h = harness(StaticPolicy::allow_all());
        h.runner
            .run_with_recovery("unit-4", &request(), None)
            .await
            .unwrap();
        let err = h
            .runner
            .run_with_recovery("unit-4", &request(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence_error");
    }

    #[tokio::test]
    async fn test_span_metadata_and_result_storage() {
        let h = harness(StaticPolicy::allow_all());
        let result = h.runner.attempt("adhoc", &request()).await.unwrap();
        assert_eq!(h.performance.active_count(), 0);

        let id = h
            .runner
            .store_result(ResultOrigin::Request("r-1".into()), "owner-1", result)
            .await
            .unwrap();
        let stored = h.store.results().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].owner_id, "owner-1");
        assert_eq!(stored[0].origin, ResultOrigin::Request("r-1".into()));
    }
}
