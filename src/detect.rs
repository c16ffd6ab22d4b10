//! Block and challenge detection.
//!
//! A heuristic, not a guarantee: sites that block silently with well-formed
//! empty pages slip past the phrase scan and are caught by the controller's
//! progress checks instead. A false positive costs one unnecessary (but
//! harmless) identity rotation.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

/// Phrase list configuration for the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Indicator phrases matched case-insensitively against page content.
    #[serde(default = "default_phrases")]
    pub phrases: Vec<String>,
}

fn default_phrases() -> Vec<String> {
    vec!["blocked".to_string(), "access denied".to_string()]
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            phrases: default_phrases(),
        }
    }
}

/// Decides whether a fetched page means the session has been blocked.
#[derive(Debug, Clone)]
pub struct BlockDetector {
    phrases: Vec<String>,
}

impl BlockDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            phrases: config.phrases.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Phrase scan only.
    pub fn content_blocked(&self, html: &str) -> bool {
        let lowered = html.to_lowercase();
        self.phrases.iter().any(|phrase| lowered.contains(phrase))
    }

    /// Full check: indicator phrase present, or the expected repeating item
    /// container absent when one was expected.
    pub fn is_blocked(&self, html: &str, expected_container: Option<&Selector>) -> bool {
        if self.content_blocked(html) {
            return true;
        }
        if let Some(selector) = expected_container {
            let doc = Html::parse_document(html);
            return doc.select(selector).next().is_none();
        }
        false
    }
}
