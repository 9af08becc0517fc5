//! Rendering backend seam: a shared session that hands out per-call pages.

use crate::error::Result;
use crate::results::DiscoveredEndpoint;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Script returning navigation timing for the current document
pub const PERFORMANCE_SCRIPT: &str = r#"
const performance = window.performance;
const timing = performance.timing;
const paint = performance.getEntriesByType('paint')[0];
return {
    load_time_ms: timing.loadEventEnd > 0 ? timing.loadEventEnd - timing.navigationStart : null,
    dom_content_loaded_ms: timing.domContentLoadedEventEnd > 0
        ? timing.domContentLoadedEventEnd - timing.navigationStart
        : null,
    first_paint_ms: paint ? paint.startTime : null,
    resource_count: performance.getEntriesByType('resource').length
};
"#;

/// Script returning external scripts, forms and password inputs
pub const SECURITY_SCRIPT: &str = r#"
const origin = window.location.origin;
return {
    third_party_scripts: Array.from(document.scripts)
        .filter(script => script.src && !script.src.startsWith(origin))
        .map(script => script.src),
    forms: Array.from(document.forms).map(form => ({
        action: form.action,
        method: form.method,
        has_password: Boolean(form.querySelector('input[type="password"]'))
    })),
    has_password_field: Boolean(document.querySelector('input[type="password"]'))
};
"#;

/// Final response of a navigation
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
}

impl PageResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Creates rendering sessions
#[async_trait]
pub trait RenderingBackend: Send + Sync {
    /// Start a browser session presenting `user_agent`
    async fn open_session(&self, user_agent: &str) -> Result<Arc<dyn RenderSession>>;
}

/// A long-lived browser session shared by all crawls
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Open a fresh page scoped to one crawl
    async fn open_page(&self) -> Result<Box<dyn RenderPage>>;

    async fn close(&self) -> Result<()>;
}

/// A page (tab) used by exactly one crawl attempt
#[async_trait]
pub trait RenderPage: Send {
    /// Navigate and wait for network quiescence, bounded by `timeout`
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageResponse>;

    /// Rendered document source
    async fn content(&mut self) -> Result<String>;

    /// PNG screenshot of the viewport
    async fn screenshot(&mut self) -> Result<Vec<u8>>;

    /// Run a script body in the page and return its JSON result
    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value>;

    /// Reload the page and report network calls of the given resource types
    async fn capture_requests(
        &mut self,
        resource_types: &[String],
        timeout: Duration,
    ) -> Result<Vec<DiscoveredEndpoint>>;

    /// Release the page; the session stays open
    async fn close(&mut self) -> Result<()>;
}
