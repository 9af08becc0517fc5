use crate::config::{CrawlRequest, EngineConfig, ModeOptions};
use crate::crawlers::backend::{
    PERFORMANCE_SCRIPT, RenderPage, RenderSession, RenderingBackend, SECURITY_SCRIPT,
};
use crate::crawlers::policy::{self, PolicySource};
use crate::error::{Error, Result};
use crate::parsers;
use crate::results::{CrawlResult, ModePayload, PagePerformance, SecuritySummary};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Round-robin pool of user agents, advanced once per session creation
#[derive(Debug)]
pub struct UserAgentPool {
    agents: Vec<String>,
    next: AtomicUsize,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            agents,
            next: AtomicUsize::new(0),
        }
    }

    /// The agent the next session will use
    pub fn peek(&self) -> &str {
        let index = self.next.load(Ordering::SeqCst) % self.agents.len().max(1);
        self.agents.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn next_agent(&self) -> String {
        let index = self.next.fetch_add(1, Ordering::SeqCst) % self.agents.len().max(1);
        self.agents.get(index).cloned().unwrap_or_default()
    }
}

enum SessionState {
    Uninitialized,
    Ready {
        session: Arc<dyn RenderSession>,
        user_agent: String,
    },
    Closed,
}

/// Drives single crawl attempts against the shared rendering session
pub struct CrawlExecutor {
    backend: Arc<dyn RenderingBackend>,
    policy: Arc<dyn PolicySource>,
    user_agents: UserAgentPool,
    session: Mutex<SessionState>,
    navigation_timeout: Duration,
    respect_robots: bool,
}

impl CrawlExecutor {
    pub fn new(
        backend: Arc<dyn RenderingBackend>,
        policy: Arc<dyn PolicySource>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            backend,
            policy,
            user_agents: UserAgentPool::new(config.user_agents.clone()),
            session: Mutex::new(SessionState::Uninitialized),
            navigation_timeout: config.navigation_timeout(),
            respect_robots: config.respect_robots,
        }
    }

    /// Run one crawl: policy check, navigation, then the mode's extraction
    pub async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlResult> {
        let url = request.url.as_str();
        ::log::info!("Crawling {} in {} mode", url, request.mode());

        if self.respect_robots {
            let user_agent = self.current_user_agent().await;
            if !policy::is_allowed(self.policy.as_ref(), &request.url, &user_agent).await {
                ::log::warn!("Crawl of {} denied by robots.txt", url);
                return Err(Error::PolicyDenied {
                    url: url.to_string(),
                });
            }
        }

        let session = self.ensure_session().await?;
        let mut page = session.open_page().await?;

        let outcome = self.drive(page.as_mut(), request).await;

        // The page is scoped to this call whatever the outcome
        if let Err(e) = page.close().await {
            ::log::warn!("Failed to close page for {}: {}", url, e);
        }

        match &outcome {
            Ok(result) => ::log::debug!("Crawled {} with status {}", url, result.status_code),
            Err(e) => ::log::error!("Crawling error for {}: {}", url, e),
        }
        outcome
    }

    async fn drive(&self, page: &mut dyn RenderPage, request: &CrawlRequest) -> Result<CrawlResult> {
        let url = request.url.as_str();
        let nav_timeout = request.timeout(self.navigation_timeout);

        let response = match timeout(nav_timeout, page.navigate(&request.url, nav_timeout)).await
        {
            Ok(response) => response?,
            Err(_) => {
                return Err(Error::fetch(
                    url,
                    format!("navigation timed out after {}s", nav_timeout.as_secs()),
                ));
            }
        };
        if !response.is_success() {
            return Err(Error::fetch(
                url,
                format!("Failed to load page: {}", response.status_code),
            ));
        }

        let (content, payload) = match &request.options {
            ModeOptions::Headless(options) => {
                let content = page.content().await?;
                let screenshot = if options.screenshot {
                    Some(page.screenshot().await?)
                } else {
                    None
                };
                let performance: PagePerformance =
                    evaluate_as(page, PERFORMANCE_SCRIPT, "performance timing").await?;
                let security: SecuritySummary =
                    evaluate_as(page, SECURITY_SCRIPT, "security summary").await?;
                (
                    Some(content),
                    ModePayload::Headless {
                        screenshot,
                        performance,
                        security,
                    },
                )
            }
            ModeOptions::Structured(options) => {
                let html = page.content().await?;
                (
                    None,
                    ModePayload::Structured(parsers::parse_structured(&html, options)),
                )
            }
            ModeOptions::ApiDiscovery(options) => {
                let capture = page.capture_requests(&options.resource_types, nav_timeout);
                let api_endpoints = match timeout(nav_timeout, capture).await {
                    Ok(endpoints) => endpoints?,
                    Err(_) => {
                        return Err(Error::fetch(
                            url,
                            format!("reload timed out after {}s", nav_timeout.as_secs()),
                        ));
                    }
                };
                ::log::info!("Discovered {} API calls on {}", api_endpoints.len(), url);
                (None, ModePayload::ApiDiscovery { api_endpoints })
            }
        };

        Ok(CrawlResult {
            url: url.to_string(),
            timestamp: Utc::now(),
            status_code: response.status_code,
            headers: response.headers,
            content,
            payload,
        })
    }

    /// Returns the shared session, creating it on first use
    async fn ensure_session(&self) -> Result<Arc<dyn RenderSession>> {
        let mut state = self.session.lock().await;
        match &*state {
            SessionState::Ready { session, .. } => Ok(session.clone()),
            SessionState::Closed => Err(Error::SessionClosed),
            SessionState::Uninitialized => {
                let user_agent = self.user_agents.next_agent();
                ::log::info!("Starting rendering session as {}", user_agent);
                let session = self.backend.open_session(&user_agent).await?;
                *state = SessionState::Ready {
                    session: session.clone(),
                    user_agent,
                };
                Ok(session)
            }
        }
    }

    async fn current_user_agent(&self) -> String {
        match &*self.session.lock().await {
            SessionState::Ready { user_agent, .. } => user_agent.clone(),
            _ => self.user_agents.peek().to_string(),
        }
    }

    pub async fn is_session_open(&self) -> bool {
        matches!(&*self.session.lock().await, SessionState::Ready { .. })
    }

    /// Release the shared session; later crawls fail with a backend error
    pub async fn close(&self) -> Result<()> {
        let mut state = self.session.lock().await;
        match std::mem::replace(&mut *state, SessionState::Closed) {
            SessionState::Ready { session, .. } => {
                ::log::info!("Closing rendering session");
                session.close().await
            }
            SessionState::Uninitialized | SessionState::Closed => Ok(()),
        }
    }
}

async fn evaluate_as<T: DeserializeOwned>(
    page: &mut dyn RenderPage,
    script: &str,
    what: &str,
) -> Result<T> {
    let value = page.evaluate(script).await?;
    serde_json::from_value(value)
        .map_err(|e| Error::Backend(format!("unexpected {} payload: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiDiscoveryOptions, HeadlessOptions, StructuredOptions};
    use crate::testing::{FakeBackend, Navigation, StaticPolicy};

    fn executor(backend: &FakeBackend, policy: StaticPolicy) -> CrawlExecutor {
        CrawlExecutor::new(
            Arc::new(backend.clone()),
            Arc::new(policy),
            &EngineConfig::default(),
        )
    }

    fn request(options: ModeOptions) -> CrawlRequest {
        CrawlRequest::parse("https://example.com/page", options).unwrap()
    }

    #[tokio::test]
    async fn test_headless_mode_collects_everything() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::allow_all());

        let result = executor.crawl(&request(ModeOptions::default())).await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.headers["content-type"], "text/html");
        assert!(result.content.as_deref().unwrap().contains("Sample page"));
        match result.payload {
            ModePayload::Headless {
                screenshot,
                performance,
                security,
            } => {
                assert!(screenshot.is_some());
                assert_eq!(performance.resource_count, 7);
                assert_eq!(performance.first_paint_ms, Some(40.5));
                assert!(security.has_password_field);
                assert_eq!(security.forms.len(), 1);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(backend.pages_closed(), 1);
    }

    #[tokio::test]
    async fn test_headless_without_screenshot() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::allow_all());
        let options = ModeOptions::Headless(HeadlessOptions {
            screenshot: false,
            timeout_secs: None,
        });

        let result = executor.crawl(&request(options)).await.unwrap();
        assert!(matches!(
            result.payload,
            ModePayload::Headless {
                screenshot: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_structured_mode_skips_malformed_block() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::allow_all());

        let result = executor
            .crawl(&request(ModeOptions::Structured(StructuredOptions::default())))
            .await
            .unwrap();
        assert!(result.content.is_none());
        let ModePayload::Structured(data) = result.payload else {
            panic!("expected structured payload");
        };
        assert_eq!(data.schema_org.len(), 1);
        assert_eq!(data.schema_org[0]["@type"], "WebPage");
        assert_eq!(data.meta_tags["description"], "Sample page");
        assert_eq!(data.open_graph["title"], "Sample");
    }

    #[tokio::test]
    async fn test_api_discovery_reports_only_api_calls() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::allow_all());

        let result = executor
            .crawl(&request(ModeOptions::ApiDiscovery(
                ApiDiscoveryOptions::default(),
            )))
            .await
            .unwrap();
        let ModePayload::ApiDiscovery { api_endpoints } = result.payload else {
            panic!("expected api discovery payload");
        };
        let urls: Vec<&str> = api_endpoints.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/api/items",
                "https://example.com/api/user"
            ]
        );
    }

    #[tokio::test]
    async fn test_policy_denial_skips_backend() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::new(Some("User-agent: *\nDisallow: /")));

        let err = executor
            .crawl(&request(ModeOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { .. }));
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_policy_check_can_be_disabled() {
        let backend = FakeBackend::new();
        let config = EngineConfig {
            respect_robots: false,
            ..EngineConfig::default()
        };
        let policy = Arc::new(StaticPolicy::new(Some("User-agent: *\nDisallow: /")));
        let executor = CrawlExecutor::new(Arc::new(backend.clone()), policy.clone(), &config);

        executor.crawl(&request(ModeOptions::default())).await.unwrap();
        assert!(policy.requested().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_fetch_error_and_page_is_released() {
        let backend = FakeBackend::new();
        backend.push_navigations([Navigation::Status(503)]);
        let executor = executor(&backend, StaticPolicy::allow_all());

        let err = executor
            .crawl(&request(ModeOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch_error");
        assert!(err.to_string().contains("503"));
        assert_eq!(backend.pages_opened(), 1);
        assert_eq!(backend.pages_closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_navigation_times_out() {
        let backend = FakeBackend::new();
        backend.push_navigations([Navigation::Hang]);
        let executor = executor(&backend, StaticPolicy::allow_all());

        let err = executor
            .crawl(&request(ModeOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch_error");
        assert!(err.to_string().contains("timed out after 30s"));
        assert_eq!(backend.pages_closed(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let backend = FakeBackend::new();
        backend.push_navigations([Navigation::BackendFailure]);
        let executor = executor(&backend, StaticPolicy::allow_all());

        let err = executor
            .crawl(&request(ModeOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_error");
    }

    #[tokio::test]
    async fn test_session_is_shared_and_closed_once() {
        let backend = FakeBackend::new();
        let executor = Arc::new(executor(&backend, StaticPolicy::allow_all()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .crawl(&request(ModeOptions::Structured(StructuredOptions::default())))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(backend.pages_opened(), 5);
        assert_eq!(backend.pages_closed(), 5);

        executor.close().await.unwrap();
        executor.close().await.unwrap();
        assert_eq!(backend.sessions_closed(), 1);

        let err = executor
            .crawl(&request(ModeOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
        assert_eq!(err.kind(), "backend_error");
        assert_eq!(backend.sessions_opened(), 1);
    }

    #[test]
    fn test_user_agents_rotate_round_robin() {
        let pool = UserAgentPool::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(pool.peek(), "a");
        let seen: Vec<String> = (0..4).map(|_| pool.next_agent()).collect();
        assert_eq!(seen, vec!["a", "b", "c", "a"]);
        assert_eq!(pool.peek(), "b");
    }

    #[tokio::test]
    async fn test_session_uses_first_user_agent() {
        let backend = FakeBackend::new();
        let executor = executor(&backend, StaticPolicy::allow_all());
        executor.crawl(&request(ModeOptions::default())).await.unwrap();
        executor.crawl(&request(ModeOptions::default())).await.unwrap();

        let agents = backend.user_agents();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].contains("Windows NT 10.0"));
    }
}
