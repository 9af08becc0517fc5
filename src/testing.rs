//! In-process fakes for the rendering backend and policy source.

use crate::crawlers::backend::{
    PERFORMANCE_SCRIPT, PageResponse, RenderPage, RenderSession, RenderingBackend, SECURITY_SCRIPT,
};
use crate::crawlers::policy::PolicySource;
use crate::error::{Error, Result};
use crate::results::DiscoveredEndpoint;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const SAMPLE_HTML: &str = r#"<html><head>
<meta name="description" content="Sample page">
<meta property="og:title" content="Sample">
<script type="application/ld+json">{"@type": "WebPage", "name": "Sample"}</script>
<script type="application/ld+json">{"@type": </script>
</head><body><form action="/login" method="post"><input type="password"></form></body></html>"#;

/// How the next navigation behaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Navigation {
    Ok,
    Status(u16),
    /// Never completes; the caller's timeout must fire
    Hang,
    BackendFailure,
}

#[derive(Default)]
struct FakeState {
    navigations: Mutex<VecDeque<Navigation>>,
    user_agents: Mutex<Vec<String>>,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    navigate_calls: AtomicUsize,
}

/// Backend whose pages serve [`SAMPLE_HTML`] unless told otherwise
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue navigation behaviors; once drained every navigation succeeds
    pub fn push_navigations(&self, navigations: impl IntoIterator<Item = Navigation>) {
        self.state
            .navigations
            .lock()
            .unwrap()
            .extend(navigations);
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.state.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.state.pages_closed.load(Ordering::SeqCst)
    }

    pub fn navigate_calls(&self) -> usize {
        self.state.navigate_calls.load(Ordering::SeqCst)
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.state.user_agents.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenderingBackend for FakeBackend {
    async fn open_session(&self, user_agent: &str) -> Result<Arc<dyn RenderSession>> {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.state
            .user_agents
            .lock()
            .unwrap()
            .push(user_agent.to_string());
        Ok(Arc::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<FakeState>,
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn open_page(&self) -> Result<Box<dyn RenderPage>> {
        self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePage {
    state: Arc<FakeState>,
}

#[async_trait]
impl RenderPage for FakePage {
    async fn navigate(&mut self, url: &Url, _timeout: Duration) -> Result<PageResponse> {
        self.state.navigate_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .state
            .navigations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Navigation::Ok);
        let status_code = match next {
            Navigation::Ok => 200,
            Navigation::Status(code) => code,
            Navigation::Hang => std::future::pending().await,
            Navigation::BackendFailure => {
                return Err(Error::Backend(format!("browser crashed loading {}", url)));
            }
        };
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        Ok(PageResponse {
            status_code,
            headers,
        })
    }

    async fn content(&mut self) -> Result<String> {
        Ok(SAMPLE_HTML.to_string())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value> {
        if script == PERFORMANCE_SCRIPT {
            Ok(serde_json::json!({
                "load_time_ms": 120.0,
                "dom_content_loaded_ms": 80.0,
                "first_paint_ms": 40.5,
                "resource_count": 7
            }))
        } else if script == SECURITY_SCRIPT {
            Ok(serde_json::json!({
                "third_party_scripts": ["https://cdn.example.net/lib.js"],
                "forms": [{ "action": "https://example.com/login", "method": "post", "has_password": true }],
                "has_password_field": true
            }))
        } else {
            Ok(serde_json::Value::Null)
        }
    }

    async fn capture_requests(
        &mut self,
        resource_types: &[String],
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredEndpoint>> {
        let observed = [
            ("https://example.com/api/items", "fetch"),
            ("https://example.com/api/user", "xmlhttprequest"),
            ("https://example.com/style.css", "link"),
        ];
        Ok(observed
            .iter()
            .filter(|(_, kind)| resource_types.iter().any(|t| t == kind))
            .map(|(url, kind)| DiscoveredEndpoint {
                url: url.to_string(),
                method: Some("GET".to_string()),
                headers: BTreeMap::new(),
                resource_type: kind.to_string(),
            })
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Policy source returning a fixed document
pub struct StaticPolicy {
    content: Option<String>,
    requested: Mutex<Vec<String>>,
}

impl StaticPolicy {
    pub fn new(content: Option<&str>) -> Self {
        Self {
            content: content.map(str::to_string),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(None)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn fetch(&self, robots_url: &Url) -> Option<String> {
        self.requested
            .lock()
            .unwrap()
            .push(robots_url.to_string());
        self.content.clone()
    }
}
