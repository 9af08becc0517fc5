use crate::config::StructuredOptions;
use crate::results::StructuredData;
use scraper::{Html, Selector};
use std::collections::BTreeMap;

/// JSON-LD blocks found in a document
#[derive(Debug, Default)]
pub struct SchemaBlocks {
    pub parsed: Vec<serde_json::Value>,
    /// Blocks that were present but not valid JSON
    pub malformed: usize,
}

/// Extracts JSON-LD, `<meta name>` and Open Graph metadata from an HTML document
pub fn parse_structured(html: &str, options: &StructuredOptions) -> StructuredData {
    let doc = Html::parse_document(html);

    let schema = schema_org_blocks(&doc);
    if schema.malformed > 0 {
        ::log::debug!(
            "Skipped {} malformed structured-data blocks",
            schema.malformed
        );
    }

    StructuredData {
        schema_org: schema.parsed,
        meta_tags: if options.meta_tags {
            meta_tags(&doc)
        } else {
            BTreeMap::new()
        },
        open_graph: if options.open_graph {
            open_graph(&doc)
        } else {
            BTreeMap::new()
        },
    }
}

/// Parses every `application/ld+json` script, skipping malformed ones with a warning
pub fn schema_org_blocks(doc: &Html) -> SchemaBlocks {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
    let mut blocks = SchemaBlocks::default();

    for script in doc.select(&selector) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<serde_json::Value>(raw.trim()) {
            Ok(value) => blocks.parsed.push(value),
            Err(e) => {
                ::log::warn!("Failed to parse schema.org data: {}", e);
                blocks.malformed += 1;
            }
        }
    }

    blocks
}

/// Collects `<meta name="..." content="...">` pairs
pub fn meta_tags(doc: &Html) -> BTreeMap<String, String> {
    let selector = Selector::parse("meta[name][content]").unwrap();
    doc.select(&selector)
        .filter_map(|e| {
            let name = e.value().attr("name")?;
            let content = e.value().attr("content")?;
            Some((name.to_string(), content.to_string()))
        })
        .collect()
}

/// Collects Open Graph properties with the `og:` prefix stripped
pub fn open_graph(doc: &Html) -> BTreeMap<String, String> {
    let selector = Selector::parse(r#"meta[property^="og:"][content]"#).unwrap();
    doc.select(&selector)
        .filter_map(|e| {
            let property = e.value().attr("property")?.strip_prefix("og:")?;
            let content = e.value().attr("content")?;
            Some((property.to_string(), content.to_string()))
        })
        .collect()
}
