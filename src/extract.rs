//! Field extraction with ordered fallback selector chains.
//!
//! Markup on these sites drifts between pages (tag and class changes across
//! listing templates), so each field declares an ordered list of selector
//! strategies and the first one that yields a value wins. A field with no
//! match becomes the configured empty sentinel, never an error; a missing
//! field must not cost the whole record.
//!
//! Everything here is synchronous and side-effect free. `scraper::Html` is
//! not `Send`, so parsed documents never cross an await point; callers hand
//! in the raw HTML string.

use anyhow::Context;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

use crate::record::{Record, TARGET_URL_FIELD};

/// A post-processing step applied to an extracted raw value, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PostProcess {
    /// Trim surrounding whitespace.
    Trim,
    /// Drop a literal prefix if present (e.g. `"Sold By "`).
    StripPrefix { prefix: String },
    /// Keep one capture group of a pattern; no match means no value.
    Capture { pattern: String, group: usize },
    /// Resolve a relative reference against the page URL.
    ResolveUrl,
}

/// Declarative description of one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Ordered fallback chain of CSS selectors; first match wins.
    pub selectors: Vec<String>,
    /// Read this attribute of the matched element instead of its text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<PostProcess>,
}

impl FieldSpec {
    pub fn text(name: &str, selectors: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            attribute: None,
            post: vec![PostProcess::Trim],
        }
    }

    pub fn attr(name: &str, selectors: &[&str], attribute: &str) -> Self {
        Self {
            name: name.to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            attribute: Some(attribute.to_string()),
            post: vec![PostProcess::ResolveUrl],
        }
    }

    pub fn with_post(mut self, post: Vec<PostProcess>) -> Self {
        self.post = post;
        self
    }
}

enum CompiledPost {
    Trim,
    StripPrefix(String),
    Capture(Regex, usize),
    ResolveUrl,
}

struct CompiledField {
    name: String,
    chain: Vec<Selector>,
    attribute: Option<String>,
    post: Vec<CompiledPost>,
}

/// Compiled extraction template: selector chains and post-processing ready
/// to run against any number of pages.
pub struct FieldExtractor {
    fields: Vec<CompiledField>,
    sentinel: String,
}

impl FieldExtractor {
    /// Compile field specs. Invalid selectors or patterns are configuration
    /// errors and fail up front, before any navigation happens.
    pub fn compile(specs: &[FieldSpec], sentinel: &str) -> anyhow::Result<Self> {
        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut chain = Vec::with_capacity(spec.selectors.len());
            for selector in &spec.selectors {
                let parsed = Selector::parse(selector).map_err(|e| {
                    anyhow::anyhow!("field '{}': bad selector '{}': {e}", spec.name, selector)
                })?;
                chain.push(parsed);
            }
            let mut post = Vec::with_capacity(spec.post.len());
            for step in &spec.post {
                post.push(match step {
                    PostProcess::Trim => CompiledPost::Trim,
                    PostProcess::StripPrefix { prefix } => {
                        CompiledPost::StripPrefix(prefix.clone())
                    }
                    PostProcess::Capture { pattern, group } => {
                        let regex = Regex::new(pattern).with_context(|| {
                            format!("field '{}': bad pattern '{}'", spec.name, pattern)
                        })?;
                        CompiledPost::Capture(regex, *group)
                    }
                    PostProcess::ResolveUrl => CompiledPost::ResolveUrl,
                });
            }
            fields.push(CompiledField {
                name: spec.name.clone(),
                chain,
                attribute: spec.attribute.clone(),
                post,
            });
        }
        Ok(Self {
            fields,
            sentinel: sentinel.to_string(),
        })
    }

    /// Extract a single record from a detail page whose URL is already known.
    /// Seed-known fields are laid down first; extracted values overwrite
    /// them, and a field with no match keeps its seed value if it has one.
    pub fn extract_detail(
        &self,
        html: &str,
        page_url: &str,
        known_fields: &Map<String, Value>,
    ) -> Record {
        let doc = Html::parse_document(html);
        let mut record = Record::from_fields(known_fields.clone());
        self.fill(&mut record, doc.root_element(), page_url);
        record.set(TARGET_URL_FIELD, page_url);
        record
    }

    /// Extract one record per repeating item container on a listing page.
    /// A malformed item degrades to sentinels; it never aborts the page.
    pub fn extract_listing(
        &self,
        html: &str,
        page_url: &str,
        item_selector: &Selector,
    ) -> Vec<Record> {
        let doc = Html::parse_document(html);
        let mut records = Vec::new();
        for item in doc.select(item_selector) {
            let mut record = Record::new();
            self.fill(&mut record, item, page_url);
            records.push(record);
        }
        records
    }

    fn fill(&self, record: &mut Record, scope: ElementRef<'_>, page_url: &str) {
        for field in &self.fields {
            match self.evaluate(field, scope, page_url) {
                Some(value) => record.set(&field.name, value),
                None => {
                    let keep_seed = record
                        .get(&field.name)
                        .is_some_and(|existing| !existing.is_empty());
                    if !keep_seed {
                        record.set(&field.name, self.sentinel.clone());
                    }
                }
            }
        }
    }

    /// First strategy in the chain that yields a raw value wins; the raw
    /// value then runs the post-processing pipeline, which may still reject
    /// it (a failed capture counts as no value).
    fn evaluate(
        &self,
        field: &CompiledField,
        scope: ElementRef<'_>,
        page_url: &str,
    ) -> Option<String> {
        for selector in &field.chain {
            let Some(element) = scope.select(selector).next() else {
                continue;
            };
            let raw = match &field.attribute {
                Some(attr) => match element.value().attr(attr) {
                    Some(value) => value.to_string(),
                    // Matched element without the attribute: try the next
                    // strategy in the chain.
                    None => continue,
                },
                None => element.text().collect::<String>(),
            };
            if let Some(value) = apply_post(&field.post, raw, page_url) {
                return Some(value);
            }
        }
        None
    }
}

fn apply_post(steps: &[CompiledPost], raw: String, page_url: &str) -> Option<String> {
    let mut value = raw;
    for step in steps {
        value = match step {
            CompiledPost::Trim => value.trim().to_string(),
            CompiledPost::StripPrefix(prefix) => value
                .strip_prefix(prefix.as_str())
                .map(str::to_string)
                .unwrap_or(value),
            CompiledPost::Capture(regex, group) => {
                let captures = regex.captures(&value)?;
                captures.get(*group)?.as_str().to_string()
            }
            CompiledPost::ResolveUrl => resolve_reference(page_url, &value),
        };
    }
    if value.is_empty() {
        return None;
    }
    Some(value)
}

/// Resolve a possibly-relative reference against the page URL. Falls back to
/// the raw value when the base itself does not parse.
fn resolve_reference(page_url: &str, reference: &str) -> String {
    match Url::parse(page_url).and_then(|base| base.join(reference)) {
        Ok(url) => url.to_string(),
        Err(e) => {
            warn!("could not resolve '{}' against {}: {}", reference, page_url, e);
            reference.to_string()
        }
    }
}
