//! Seed input interface.
//!
//! Seeds arrive as an ordered sequence of target descriptors. Producing the
//! file is someone else's job (spreadsheet exports and the like); this module
//! only defines the descriptor shape and a tolerant newline-delimited reader.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// One crawl target: a path or absolute URL, plus any fields already known
/// about the item (these pre-populate the extracted record).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedTarget {
    pub path_or_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub known_fields: Map<String, Value>,
}

impl SeedTarget {
    pub fn from_path(path_or_id: impl Into<String>) -> Self {
        Self {
            path_or_id: path_or_id.into(),
            known_fields: Map::new(),
        }
    }

    /// Resolve this target against the site base URL. Absolute URLs pass
    /// through untouched.
    pub fn resolve_url(&self, base_url: &str) -> String {
        let path = self.path_or_id.trim();
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match Url::parse(base_url).and_then(|base| base.join(path)) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", base_url.trim_end_matches('/'), path),
        }
    }
}

/// Read seeds from a newline-delimited file. Each non-blank line is either a
/// JSON descriptor or a bare path/URL.
pub fn load_seeds(path: &Path) -> anyhow::Result<Vec<SeedTarget>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;

    let mut seeds = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            let seed: SeedTarget = serde_json::from_str(line)
                .with_context(|| format!("malformed seed on line {}", number + 1))?;
            seeds.push(seed);
        } else {
            seeds.push(SeedTarget::from_path(line));
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolve_joins_relative_paths() {
        let seed = SeedTarget::from_path("product/42");
        assert_eq!(
            seed.resolve_url("http://market.onion/"),
            "http://market.onion/product/42"
        );
    }

    #[test]
    fn resolve_passes_absolute_urls_through() {
        let seed = SeedTarget::from_path("http://other.onion/p/1");
        assert_eq!(seed.resolve_url("http://market.onion/"), "http://other.onion/p/1");
    }

    #[test]
    fn load_mixes_json_and_bare_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "product/1").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            "{}",
            r#"{"path_or_id":"product/2","known_fields":{"title":"Known"}}"#
        )
        .unwrap();

        let seeds = load_seeds(file.path()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].path_or_id, "product/1");
        assert_eq!(seeds[1].known_fields.get("title").unwrap(), "Known");
    }

    #[test]
    fn load_reports_malformed_json_with_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{not json").unwrap();
        let err = load_seeds(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
