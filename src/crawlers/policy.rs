use crate::parsers::RobotsPolicy;
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Fetches a site's robots.txt
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// The policy document, or `None` when it is missing or unreachable
    async fn fetch(&self, robots_url: &Url) -> Option<String>;
}

/// Location of the exclusion policy for `url`'s origin
pub fn robots_url(url: &Url) -> Option<Url> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    Some(robots)
}

/// Whether `user_agent` may crawl `url`; unavailable policies allow everything
pub async fn is_allowed(source: &dyn PolicySource, url: &Url, user_agent: &str) -> bool {
    let Some(robots) = robots_url(url) else {
        return true;
    };
    match source.fetch(&robots).await {
        Some(content) => {
            let denied = RobotsPolicy::parse(&content).is_blanket_disallow(user_agent);
            if denied {
                ::log::info!("robots.txt at {} disallows all crawling", robots);
            }
            !denied
        }
        None => {
            ::log::debug!("No robots.txt at {}, assuming allowed", robots);
            true
        }
    }
}

/// Fetches robots.txt over HTTP with a short timeout
pub struct HttpPolicySource {
    client: reqwest::Client,
}

impl HttpPolicySource {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                ::log::warn!("Failed to build policy HTTP client ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self, robots_url: &Url) -> Option<String> {
        let response = match self.client.get(robots_url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                ::log::debug!("Failed to fetch {}: {}", robots_url, e);
                return None;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            ::log::debug!("{} returned {}", robots_url, response.status());
            return None;
        }
        response.text().await.ok()
    }
}
