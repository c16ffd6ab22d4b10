//! Next-page control location and activation.
//!
//! Pagination controls drift as much as item markup does, so the control is
//! located through an ordered list of strategies; the first one that matches
//! the current page wins. Location happens on parsed HTML; activation is a
//! script click that scrolls the control into view first, since off-screen
//! controls on these sites swallow plain clicks.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

/// One way of finding the "next page" control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextPageStrategy {
    /// CSS selector for the control.
    Css { selector: String },
    /// Any anchor whose visible text contains the given string.
    LinkText { text: String },
}

impl NextPageStrategy {
    pub fn css(selector: &str) -> Self {
        Self::Css {
            selector: selector.to_string(),
        }
    }

    pub fn link_text(text: &str) -> Self {
        Self::LinkText {
            text: text.to_string(),
        }
    }

    /// Default chain for marketplace listings.
    pub fn default_chain() -> Vec<Self> {
        vec![
            Self::link_text("Next"),
            Self::css("li.next a"),
            Self::css("a[rel='next']"),
            Self::css("a[aria-label='Next']"),
        ]
    }
}

enum Compiled {
    Css(Selector, String),
    LinkText(String),
}

/// Ordered set of next-page strategies, compiled once.
pub struct NextPageLocator {
    strategies: Vec<Compiled>,
}

impl NextPageLocator {
    pub fn compile(strategies: &[NextPageStrategy]) -> anyhow::Result<Self> {
        let mut compiled = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            compiled.push(match strategy {
                NextPageStrategy::Css { selector } => {
                    let parsed = Selector::parse(selector)
                        .map_err(|e| anyhow::anyhow!("bad next-page selector '{selector}': {e}"))?;
                    Compiled::Css(parsed, selector.clone())
                }
                NextPageStrategy::LinkText { text } => Compiled::LinkText(text.clone()),
            });
        }
        Ok(Self {
            strategies: compiled,
        })
    }

    /// First strategy that matches the page, if any. `None` means the
    /// listing is exhausted.
    pub fn locate(&self, html: &str) -> Option<&dyn ClickTarget> {
        let doc = Html::parse_document(html);
        let anchors = Selector::parse("a").expect("static selector");
        for strategy in &self.strategies {
            let found = match strategy {
                Compiled::Css(selector, _) => doc.select(selector).next().is_some(),
                Compiled::LinkText(needle) => doc.select(&anchors).any(|a| {
                    a.text().collect::<String>().contains(needle.as_str())
                }),
            };
            if found {
                return Some(strategy);
            }
        }
        None
    }
}

/// A located control that can be activated by script.
pub trait ClickTarget {
    /// Script that scrolls the control into view and clicks it; evaluates to
    /// `true` if the control was still there.
    fn click_script(&self) -> String;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl ClickTarget for Compiled {
    fn click_script(&self) -> String {
        match self {
            Compiled::Css(_, selector) => {
                let quoted = serde_json::to_string(selector).expect("string is valid json");
                format!(
                    "(() => {{ const el = document.querySelector({quoted}); \
                     if (!el) return false; \
                     el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()"
                )
            }
            Compiled::LinkText(text) => {
                let quoted = serde_json::to_string(text).expect("string is valid json");
                format!(
                    "(() => {{ const el = [...document.querySelectorAll('a')]\
                     .find(a => a.textContent.includes({quoted})); \
                     if (!el) return false; \
                     el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()"
                )
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Compiled::Css(_, selector) => format!("css '{selector}'"),
            Compiled::LinkText(text) => format!("link text '{text}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> NextPageLocator {
        NextPageLocator::compile(&NextPageStrategy::default_chain()).unwrap()
    }

    #[test]
    fn link_text_strategy_matches_first() {
        let html = r#"<ul><li class="next"><a href="/p2">More</a></li>
                      <a href="/p2">Next page</a></ul>"#;
        let locator = locator();
        let target = locator.locate(html).unwrap();
        assert_eq!(target.describe(), "link text 'Next'");
    }

    #[test]
    fn falls_through_to_css_strategies() {
        let html = r#"<li class="next"><a href="/p2">weiter</a></li>"#;
        let locator = locator();
        let target = locator.locate(html).unwrap();
        assert_eq!(target.describe(), "css 'li.next a'");
    }

    #[test]
    fn rel_next_matches() {
        let html = r#"<a rel="next" href="/p2">&raquo;</a>"#;
        assert!(locator().locate(html).is_some());
    }

    #[test]
    fn no_control_means_exhausted() {
        let html = r#"<div class="pagination"><span>1</span><span>2</span></div>"#;
        assert!(locator().locate(html).is_none());
    }

    #[test]
    fn click_script_escapes_selector() {
        let strategies = [NextPageStrategy::css("a[aria-label='Next']")];
        let locator = NextPageLocator::compile(&strategies).unwrap();
        let html = r#"<a aria-label="Next" href="/p2">x</a>"#;
        let script = locator.locate(html).unwrap().click_script();
        assert!(script.contains(r#""a[aria-label='Next']""#));
        assert!(script.contains("scrollIntoView"));
    }

    #[test]
    fn bad_selector_fails_compile() {
        let strategies = [NextPageStrategy::css("[[[")];
        assert!(NextPageLocator::compile(&strategies).is_err());
    }
}
