//! Configuration management.
//!
//! Everything tunable lives here and loads from a single TOML file: proxy
//! endpoints, navigation timeouts, pacing ranges, block-detection phrases,
//! output paths, and the two site profiles (listing and product-detail)
//! with their selector chains. Detection phrases and selector chains are
//! deliberately configuration rather than constants; the sites drift.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::browser::{BrowserSessionConfig, NavigationConfig};
use crate::crawl::NextPageStrategy;
use crate::detect::DetectionConfig;
use crate::extract::{FieldSpec, PostProcess};
use crate::identity::ProxyConfig;
use crate::pacing::PacingConfig;

/// Default config file looked for in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

/// Where run outputs land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for the checkpoint log, artifact, and error page dumps.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_checkpoint_log")]
    pub checkpoint_log: String,
    #[serde(default = "default_artifact")]
    pub artifact: String,
    #[serde(default = "default_error_page")]
    pub error_page: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_checkpoint_log() -> String {
    "capture.jsonl".to_string()
}

fn default_artifact() -> String {
    "products.json".to_string()
}

fn default_error_page() -> String {
    "error_page.html".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint_log: default_checkpoint_log(),
            artifact: default_artifact(),
            error_page: default_error_page(),
        }
    }
}

impl OutputConfig {
    pub fn checkpoint_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.checkpoint_log)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.data_dir.join(&self.artifact)
    }

    pub fn error_page_path(&self) -> PathBuf {
        self.data_dir.join(&self.error_page)
    }
}

/// Profile for walking a listing grid page by page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingProfile {
    /// First listing page. Overridable on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Page-defining marker element the navigator waits for.
    #[serde(default = "default_listing_marker")]
    pub marker: String,
    /// Repeating item container.
    #[serde(default = "default_item_selector")]
    pub item_selector: String,
    /// Ordered next-page strategies.
    #[serde(default = "NextPageStrategy::default_chain")]
    pub next: Vec<NextPageStrategy>,
    /// Value recorded for fields that match nothing.
    #[serde(default = "default_listing_sentinel")]
    pub empty_sentinel: String,
    #[serde(default = "listing_fields")]
    pub fields: Vec<FieldSpec>,
}

fn default_listing_marker() -> String {
    ".product-item".to_string()
}

fn default_item_selector() -> String {
    "div.product-item".to_string()
}

fn default_listing_sentinel() -> String {
    "N/A".to_string()
}

fn listing_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("vendor", &["a.vendor-name"]).with_post(vec![
            PostProcess::Trim,
            PostProcess::StripPrefix {
                prefix: "Sold By ".to_string(),
            },
        ]),
        FieldSpec::attr("vendor_url", &["a.vendor-name"], "href"),
        FieldSpec::text("title", &[".product-title", ".product-name", "h4", "h3"]),
        FieldSpec::text(
            "description",
            &[".product-description", ".description", ".text-justify", ".details"],
        ),
        FieldSpec::text(
            "price",
            &[".product-price", ".price", ".amount", "span[class*='price']"],
        ),
        FieldSpec::attr("url", &[".product-image a.thumb"], "href"),
        FieldSpec::attr("image", &[".product-image a.thumb img"], "src"),
    ]
}

impl Default for ListingProfile {
    fn default() -> Self {
        Self {
            url: None,
            marker: default_listing_marker(),
            item_selector: default_item_selector(),
            next: NextPageStrategy::default_chain(),
            empty_sentinel: default_listing_sentinel(),
            fields: listing_fields(),
        }
    }
}

/// Profile for scraping one known product page per seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductProfile {
    /// Site base URL that relative seed paths resolve against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Page-defining marker element the navigator waits for.
    #[serde(default = "default_product_marker")]
    pub marker: String,
    /// Value recorded for fields that match nothing.
    #[serde(default)]
    pub empty_sentinel: String,
    #[serde(default = "product_fields")]
    pub fields: Vec<FieldSpec>,
}

fn default_product_marker() -> String {
    "div.panel-body".to_string()
}

fn product_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("description", &["h1 + p", ".product-description"]),
        FieldSpec::attr("image", &["div.panel-body img"], "src"),
        FieldSpec::text("feedback_pct", &["div.user-details span.smalltext"]).with_post(vec![
            PostProcess::Capture {
                pattern: r"(\d+)%".to_string(),
                group: 1,
            },
        ]),
        FieldSpec::text("sales_count", &["div.user-details span.smalltext"]).with_post(vec![
            PostProcess::Capture {
                pattern: r"(\d+)%\D*(\d+)".to_string(),
                group: 2,
            },
        ]),
        FieldSpec::text("rating", &[".product-rating", "div.panel-body"]).with_post(vec![
            PostProcess::Capture {
                pattern: r"Rating:\s*([0-9.]+)".to_string(),
                group: 1,
            },
        ]),
        FieldSpec::text("rating_count", &[".product-rating", "div.panel-body"]).with_post(vec![
            PostProcess::Capture {
                pattern: r"Based on\s*(\d+)".to_string(),
                group: 1,
            },
        ]),
        FieldSpec::text("sales_policy", &[".sales-policy", ".policy"]),
    ]
}

impl Default for ProductProfile {
    fn default() -> Self {
        Self {
            base_url: None,
            marker: default_product_marker(),
            empty_sentinel: String::new(),
            fields: product_fields(),
        }
    }
}

/// Crawl bounds from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Consecutive-failure ceiling forcing termination.
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    /// Optional item cap per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
}

fn default_failure_ceiling() -> u32 {
    2
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: default_failure_ceiling(),
            max_items: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub browser: BrowserSessionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub listing: ListingProfile,
    #[serde(default)]
    pub product: ProductProfile,
}

impl Config {
    /// Load from an explicit path, or from `harvest.toml` if present, or
    /// fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("malformed config {}", path.display()))
    }
}
