use crate::crawlers::backend::{PageResponse, RenderPage, RenderSession, RenderingBackend};
use crate::error::{Error, Result};
use crate::results::DiscoveredEndpoint;
use async_trait::async_trait;
use fantoccini::wd::{
    Capabilities, TimeoutConfiguration, WebDriverCompatibleCommand, WindowHandle,
};
use fantoccini::{Client, ClientBuilder};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use url::Url;

/// Interval between resource-count samples while waiting for the network to settle
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Consecutive unchanged samples that count as network idle
const IDLE_STABLE_SAMPLES: usize = 2;

const RESOURCE_COUNT_SCRIPT: &str = "return performance.getEntriesByType('resource').length;";

const NAVIGATION_STATUS_SCRIPT: &str = r#"
const entry = performance.getEntriesByType('navigation')[0];
return entry && entry.responseStatus ? entry.responseStatus : null;
"#;

/// Replays the document request as HEAD to read its response headers
const RESPONSE_HEADERS_SCRIPT: &str = r#"
const done = arguments[arguments.length - 1];
fetch(window.location.href, { method: 'HEAD', credentials: 'include' })
    .then(response => {
        const headers = {};
        response.headers.forEach((value, key) => { headers[key] = value; });
        done({ status: response.status, headers: headers });
    })
    .catch(() => done(null));
"#;

const RESOURCE_ENTRIES_SCRIPT: &str = r#"
const types = arguments[0];
return performance.getEntriesByType('resource')
    .filter(entry => types.includes(entry.initiatorType))
    .map(entry => ({ url: entry.name, resource_type: entry.initiatorType }));
"#;

/// Reads (and clears) a browser log buffer through ChromeDriver's `se/log` endpoint
#[derive(Debug)]
struct GetLog {
    log_type: &'static str,
}

impl WebDriverCompatibleCommand for GetLog {
    fn endpoint(
        &self,
        base_url: &Url,
        session_id: Option<&str>,
    ) -> std::result::Result<Url, url::ParseError> {
        base_url.join(&format!("session/{}/se/log", session_id.unwrap_or_default()))
    }

    fn method_and_body(&self, _request_url: &Url) -> (http::Method, Option<String>) {
        (
            http::Method::POST,
            Some(json!({ "type": self.log_type }).to_string()),
        )
    }
}

#[derive(Deserialize)]
struct LogEntry {
    message: String,
}

#[derive(Deserialize)]
struct DevToolsEvent {
    message: DevToolsMessage,
}

#[derive(Deserialize)]
struct DevToolsMessage {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RequestWillBeSent {
    request: NetworkRequest,
    #[serde(rename = "type", default)]
    resource_type: Option<String>,
}

#[derive(Deserialize)]
struct NetworkRequest {
    url: String,
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, serde_json::Value>,
}

/// DevTools names `XHR` what resource timing calls `xmlhttprequest`
fn wanted_type(devtools_type: &str, resource_types: &[String]) -> Option<String> {
    let normalized = match devtools_type.to_ascii_lowercase().as_str() {
        "xhr" => "xmlhttprequest".to_string(),
        other => other.to_string(),
    };
    resource_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&normalized))
        .then_some(normalized)
}

/// Network requests of the wanted types from a performance log dump
fn endpoints_from_performance_log(
    log: serde_json::Value,
    resource_types: &[String],
) -> Result<Vec<DiscoveredEndpoint>> {
    let entries: Vec<LogEntry> = serde_json::from_value(log)
        .map_err(|e| Error::Backend(format!("unexpected performance log: {}", e)))?;

    let mut endpoints = Vec::new();
    for entry in entries {
        let Ok(event) = serde_json::from_str::<DevToolsEvent>(&entry.message) else {
            continue;
        };
        if event.message.method != "Network.requestWillBeSent" {
            continue;
        }
        let Ok(sent) = serde_json::from_value::<RequestWillBeSent>(event.message.params) else {
            continue;
        };
        let Some(resource_type) = sent
            .resource_type
            .as_deref()
            .and_then(|t| wanted_type(t, resource_types))
        else {
            continue;
        };
        let headers = sent
            .request
            .headers
            .into_iter()
            .map(|(name, value)| match value {
                serde_json::Value::String(value) => (name, value),
                other => (name, other.to_string()),
            })
            .collect();
        endpoints.push(DiscoveredEndpoint {
            url: sent.request.url,
            method: Some(sent.request.method),
            headers,
            resource_type,
        });
    }
    Ok(endpoints)
}

/// Instant `timeout` from now, saturating far in the future
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

#[derive(Deserialize)]
struct HeadResponse {
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ResourceEntry {
    url: String,
    resource_type: String,
}

/// Rendering backend driving a browser through a WebDriver server
pub struct WebDriverBackend {
    webdriver_url: String,
}

impl WebDriverBackend {
    pub fn new(webdriver_url: impl Into<String>) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
        }
    }
}

#[async_trait]
impl RenderingBackend for WebDriverBackend {
    async fn open_session(&self, user_agent: &str) -> Result<Arc<dyn RenderSession>> {
        let client = connect_to_webdriver(&self.webdriver_url, user_agent).await?;
        Ok(Arc::new(WebDriverSession {
            client: Arc::new(Mutex::new(client)),
        }))
    }
}

/// Headless browser capabilities for Chrome and Firefox drivers
fn capabilities(user_agent: &str) -> Capabilities {
    let mut caps = Capabilities::new();
    caps.insert(
        "goog:chromeOptions".to_string(),
        json!({
            "args": [
                "--headless=new",
                "--disable-gpu",
                "--no-sandbox",
                format!("--user-agent={}", user_agent),
            ]
        }),
    );
    caps.insert(
        "goog:loggingPrefs".to_string(),
        json!({ "performance": "ALL" }),
    );
    caps.insert(
        "moz:firefoxOptions".to_string(),
        json!({
            "args": ["-headless"],
            "prefs": { "general.useragent.override": user_agent }
        }),
    );
    caps
}

/// Connects to the WebDriver instance, falling back to common local ports
async fn connect_to_webdriver(webdriver_url: &str, user_agent: &str) -> Result<Client> {
    let mut builder = ClientBuilder::native();
    builder.capabilities(capabilities(user_agent));

    let first_error = match builder.connect(webdriver_url).await {
        Ok(client) => {
            ::log::debug!("Connected to WebDriver at {}", webdriver_url);
            return Ok(client);
        }
        Err(e) => {
            ::log::error!("Failed to connect to WebDriver at {}: {}", webdriver_url, e);
            e
        }
    };

    let fallback_urls = [
        "http://localhost:9515", // ChromeDriver default
        "http://localhost:4444", // geckodriver and Selenium default
        "http://127.0.0.1:4444", // Try with IP instead of localhost
    ];

    for url in fallback_urls.iter() {
        if *url == webdriver_url {
            continue;
        }
        ::log::info!("Trying fallback WebDriver URL: {}", url);
        if let Ok(client) = builder.connect(url).await {
            ::log::debug!("Connected to fallback WebDriver at {}", url);
            return Ok(client);
        }
    }

    ::log::error!(
        "Make sure a WebDriver server is running or set the WEBDRIVER_URL environment variable"
    );
    Err(first_error.into())
}

/// One browser; pages are tabs opened on demand and used one at a time
pub struct WebDriverSession {
    client: Arc<Mutex<Client>>,
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn open_page(&self) -> Result<Box<dyn RenderPage>> {
        // The guard lives as long as the page, so tab switching never interleaves
        let client = self.client.clone().lock_owned().await;
        let home = client.window().await?;
        let tab = client.new_window(true).await?;
        client.switch_to_window(tab.handle).await?;
        Ok(Box::new(WebDriverPage { client, home }))
    }

    async fn close(&self) -> Result<()> {
        let client = self.client.lock().await.clone();
        client.close().await?;
        Ok(())
    }
}

pub struct WebDriverPage {
    client: OwnedMutexGuard<Client>,
    home: WindowHandle,
}

impl WebDriverPage {
    /// Wait until the resource count stops changing or the deadline passes
    async fn wait_for_network_idle(&self, deadline: Instant) -> Result<()> {
        let mut last = None;
        let mut stable = 0;
        while Instant::now() < deadline {
            let count = self.client.execute(RESOURCE_COUNT_SCRIPT, vec![]).await?;
            let count = count.as_u64();
            if count.is_some() && count == last {
                stable += 1;
                if stable >= IDLE_STABLE_SAMPLES {
                    return Ok(());
                }
            } else {
                stable = 0;
                last = count;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        ::log::debug!("Network did not settle before the navigation deadline");
        Ok(())
    }

    /// Performance log entries collected since the last read, when the driver keeps them
    async fn performance_log(&self) -> Option<serde_json::Value> {
        match self
            .client
            .issue_cmd(GetLog {
                log_type: "performance",
            })
            .await
        {
            Ok(log) => Some(log),
            Err(e) => {
                ::log::debug!("Performance log unavailable: {}", e);
                None
            }
        }
    }

    /// Fallback for drivers without a performance log
    async fn resource_timing_endpoints(
        &self,
        resource_types: &[String],
    ) -> Result<Vec<DiscoveredEndpoint>> {
        let entries = self
            .client
            .execute(RESOURCE_ENTRIES_SCRIPT, vec![json!(resource_types)])
            .await?;
        let entries: Vec<ResourceEntry> = serde_json::from_value(entries)
            .map_err(|e| Error::Backend(format!("unexpected resource entries: {}", e)))?;

        // Resource timing exposes neither the method nor the request headers
        Ok(entries
            .into_iter()
            .map(|entry| DiscoveredEndpoint {
                url: entry.url,
                method: None,
                headers: BTreeMap::new(),
                resource_type: entry.resource_type,
            })
            .collect())
    }

    async fn response(&self) -> Result<PageResponse> {
        let status = self
            .client
            .execute(NAVIGATION_STATUS_SCRIPT, vec![])
            .await?
            .as_u64()
            .and_then(|s| u16::try_from(s).ok());

        let head = self
            .client
            .execute_async(RESPONSE_HEADERS_SCRIPT, vec![])
            .await
            .ok()
            .and_then(|value| serde_json::from_value::<HeadResponse>(value).ok());

        Ok(match (status, head) {
            (Some(status_code), head) => PageResponse {
                status_code,
                headers: head.map(|h| h.headers).unwrap_or_default(),
            },
            (None, Some(head)) => PageResponse {
                status_code: head.status,
                headers: head.headers,
            },
            // WebDriver reports no status; a completed navigation counts as success
            (None, None) => PageResponse {
                status_code: 200,
                headers: BTreeMap::new(),
            },
        })
    }
}

#[async_trait]
impl RenderPage for WebDriverPage {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageResponse> {
        let deadline = deadline_after(timeout);
        self.client
            .update_timeouts(TimeoutConfiguration::new(None, Some(timeout), None))
            .await?;
        self.client
            .goto(url.as_str())
            .await
            .map_err(|e| Error::fetch(url.as_str(), e.to_string()))?;
        self.wait_for_network_idle(deadline).await?;
        self.response().await
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.client.source().await?)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        Ok(self.client.screenshot().await?)
    }

    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value> {
        Ok(self.client.execute(script, vec![]).await?)
    }

    async fn capture_requests(
        &mut self,
        resource_types: &[String],
        timeout: Duration,
    ) -> Result<Vec<DiscoveredEndpoint>> {
        let deadline = deadline_after(timeout);
        // Drop events from the first load so only the reload is reported
        let has_log = self.performance_log().await.is_some();
        self.client.refresh().await?;
        self.wait_for_network_idle(deadline).await?;

        if has_log {
            if let Some(log) = self.performance_log().await {
                return endpoints_from_performance_log(log, resource_types);
            }
        }
        self.resource_timing_endpoints(resource_types).await
    }

    async fn close(&mut self) -> Result<()> {
        self.client.close_window().await?;
        self.client.switch_to_window(self.home.clone()).await?;
        Ok(())
    }
}
