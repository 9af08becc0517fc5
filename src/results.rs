use crate::config::CrawlMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one successful crawl attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    /// URL that was crawled
    pub url: String,

    /// When the page was fetched
    pub timestamp: DateTime<Utc>,

    /// Final response status
    pub status_code: u16,

    /// Final response headers
    pub headers: BTreeMap<String, String>,

    /// Rendered document (headless mode only)
    pub content: Option<String>,

    /// Mode-specific extraction output
    pub payload: ModePayload,
}

impl CrawlResult {
    pub fn mode(&self) -> CrawlMode {
        match self.payload {
            ModePayload::Headless { .. } => CrawlMode::Headless,
            ModePayload::Structured(_) => CrawlMode::Structured,
            ModePayload::ApiDiscovery { .. } => CrawlMode::ApiDiscovery,
        }
    }
}

/// Exactly one of these accompanies each result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModePayload {
    Headless {
        #[serde(default, with = "base64_bytes")]
        screenshot: Option<Vec<u8>>,
        performance: PagePerformance,
        security: SecuritySummary,
    },
    Structured(StructuredData),
    ApiDiscovery {
        api_endpoints: Vec<DiscoveredEndpoint>,
    },
}

/// Navigation timing captured from the browser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PagePerformance {
    pub load_time_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub first_paint_ms: Option<f64>,
    #[serde(default)]
    pub resource_count: u64,
}

/// Lightweight security overview of a rendered page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecuritySummary {
    /// External script sources
    #[serde(default)]
    pub third_party_scripts: Vec<String>,

    #[serde(default)]
    pub forms: Vec<FormSummary>,

    /// Any password input on the page
    #[serde(default)]
    pub has_password_field: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormSummary {
    pub action: String,
    pub method: String,
    pub has_password: bool,
}

/// Structured metadata extracted from a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredData {
    /// Parsed JSON-LD blocks
    pub schema_org: Vec<serde_json::Value>,

    /// `<meta name>` → content
    pub meta_tags: BTreeMap<String, String>,

    /// Open Graph property (without `og:`) → content
    pub open_graph: BTreeMap<String, String>,
}

/// A network call observed while the page loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub url: String,

    /// HTTP method, when the backend can observe it
    pub method: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Browser resource type (`xmlhttprequest`, `fetch`)
    pub resource_type: String,
}

/// Where a stored result came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResultOrigin {
    Job(String),
    Request(String),
}

/// A crawl result as persisted by the result store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: String,
    pub origin: ResultOrigin,
    pub owner_id: String,
    pub stored_at: DateTime<Utc>,
    pub result: CrawlResult,
}

impl StoredResult {
    pub fn new(origin: ResultOrigin, owner_id: impl Into<String>, result: CrawlResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            owner_id: owner_id.into(),
            stored_at: Utc::now(),
            result,
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screenshot_is_base64_in_json() {
        let result = CrawlResult {
            url: "https://example.com/".into(),
            timestamp: Utc::now(),
            status_code: 200,
            headers: BTreeMap::new(),
            content: Some("<html></html>".into()),
            payload: ModePayload::Headless {
                screenshot: Some(vec![0x89, b'P', b'N', b'G']),
                performance: PagePerformance::default(),
                security: SecuritySummary::default(),
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["payload"]["mode"], "headless");
        assert_eq!(value["payload"]["screenshot"], "iVBORw==");

        let back: CrawlResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.mode(), CrawlMode::Headless);
    }

    #[test]
    fn test_origin_serialization() {
        let origin = ResultOrigin::Job("J1".into());
        assert_eq!(
            serde_json::to_value(&origin).unwrap(),
            serde_json::json!({ "kind": "job", "id": "J1" })
        );
    }
}
