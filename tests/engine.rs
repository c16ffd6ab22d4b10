//! Controller-level tests over a scripted automation driver: resume,
//! dedup, circuit breaking, exhaustion, blocking recovery, cancellation.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use onionharvest::browser::{NavigationConfig, Navigator, PageDriver};
use onionharvest::crawl::{
    CrawlLimits, CrawlMode, CrawlServices, NextPageStrategy, PaginationController, RunOutcome,
};
use onionharvest::detect::{BlockDetector, DetectionConfig};
use onionharvest::error::DriverError;
use onionharvest::extract::{FieldExtractor, FieldSpec};
use onionharvest::identity::{IdentityRotator, ProxyConfig};
use onionharvest::pacing::{BackoffScheduler, NoopSleeper, PacingConfig, Sleeper};
use onionharvest::record::Record;
use onionharvest::seed::SeedTarget;
use onionharvest::store::CheckpointStore;

const BLOCKED_HTML: &str =
    r#"<html><body><div class="product-item">Access Denied</div></body></html>"#;

#[derive(Clone)]
struct FakePage {
    url: String,
    html: String,
}

#[derive(Default)]
struct DriverState {
    pages: Vec<FakePage>,
    current: usize,
    nav_timeouts: u32,
    blocked_navigations: u32,
    current_blocked: bool,
    navigations: u32,
    clicks: u32,
    cookies_cleared: u32,
    closed: bool,
}

impl DriverState {
    fn effective_html(&self) -> String {
        if self.current_blocked {
            BLOCKED_HTML.to_string()
        } else {
            self.pages
                .get(self.current)
                .map(|p| p.html.clone())
                .unwrap_or_default()
        }
    }
}

/// Scripted driver: pages are addressed by URL for navigations and advance
/// sequentially on clicks; timeouts and blocked responses are injected
/// through counters.
#[derive(Clone)]
struct ScriptedDriver(Arc<Mutex<DriverState>>);

impl ScriptedDriver {
    fn new(pages: Vec<FakePage>) -> (Self, Arc<Mutex<DriverState>>) {
        let state = Arc::new(Mutex::new(DriverState {
            pages,
            ..Default::default()
        }));
        (Self(state.clone()), state)
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let mut state = self.0.lock().unwrap();
        state.navigations += 1;
        if state.nav_timeouts > 0 {
            state.nav_timeouts -= 1;
            return Err(DriverError::Timeout {
                what: url.to_string(),
                timeout,
            });
        }
        if let Some(index) = state.pages.iter().position(|p| p.url == url) {
            state.current = index;
        }
        state.current_blocked = if state.blocked_navigations > 0 {
            state.blocked_navigations -= 1;
            true
        } else {
            false
        };
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let state = self.0.lock().unwrap();
        let needle = selector
            .rsplit(['.', '#', ' '])
            .next()
            .unwrap_or(selector);
        if state.effective_html().contains(needle) {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                what: selector.to_string(),
                timeout,
            })
        }
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok(self.0.lock().unwrap().effective_html())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let state = self.0.lock().unwrap();
        Ok(state
            .pages
            .get(state.current)
            .map(|p| p.url.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn execute_script(&self, _script: &str) -> Result<serde_json::Value, DriverError> {
        let mut state = self.0.lock().unwrap();
        state.clicks += 1;
        if state.current + 1 < state.pages.len() {
            state.current += 1;
            Ok(serde_json::Value::Bool(true))
        } else {
            Ok(serde_json::Value::Bool(false))
        }
    }

    async fn delete_cookies(&self) -> Result<(), DriverError> {
        self.0.lock().unwrap().cookies_cleared += 1;
        Ok(())
    }

    async fn close(&self) {
        self.0.lock().unwrap().closed = true;
    }
}

/// Control-port stub that keeps answering 250 so rotations succeed.
async fn permissive_control_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        return;
                    }
                    if socket.write_all(b"250 OK\r\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

fn listing_extractor() -> FieldExtractor {
    let specs = [
        FieldSpec::text("title", &[".product-title"]),
        FieldSpec::attr("url", &["a.thumb"], "href"),
    ];
    FieldExtractor::compile(&specs, "N/A").unwrap()
}

fn product_extractor() -> FieldExtractor {
    let specs = [FieldSpec::text("description", &["h1 + p"])];
    FieldExtractor::compile(&specs, "").unwrap()
}

fn services(
    driver: ScriptedDriver,
    store: CheckpointStore,
    extractor: FieldExtractor,
    control_port: u16,
) -> CrawlServices {
    let sleeper: Arc<dyn Sleeper> = Arc::new(NoopSleeper);
    let scheduler = BackoffScheduler::new(PacingConfig {
        retry_base_ms: 0,
        pace_min_ms: 0,
        pace_max_ms: 0,
        settle_ms: 0,
    });
    let navigator = Navigator::new(
        Box::new(driver),
        &NavigationConfig::default(),
        scheduler.clone(),
        sleeper.clone(),
    );
    let proxy = ProxyConfig {
        host: "127.0.0.1".into(),
        socks_port: 1,
        control_port,
    };
    let rotator = IdentityRotator::new(&proxy, Duration::ZERO, sleeper.clone());
    let detector = BlockDetector::new(&DetectionConfig::default());
    CrawlServices {
        navigator,
        extractor,
        detector,
        rotator,
        scheduler,
        sleeper,
        store,
    }
}

fn open_store(dir: &Path) -> CheckpointStore {
    CheckpointStore::open(
        dir.join("capture.jsonl"),
        dir.join("products.json"),
        dir.join("error_page.html"),
    )
    .unwrap()
}

fn limits(ceiling: u32, max_items: Option<u64>) -> CrawlLimits {
    CrawlLimits {
        max_items,
        failure_ceiling: ceiling,
    }
}

fn cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn listing_mode(start_url: &str) -> CrawlMode {
    CrawlMode::Paginated {
        start_url: start_url.to_string(),
        item_selector: "div.product-item".to_string(),
        next: NextPageStrategy::default_chain(),
    }
}

fn bounded_mode(seeds: &[&str], start: usize) -> CrawlMode {
    CrawlMode::Bounded {
        base_url: "http://market.onion/".to_string(),
        seeds: seeds.iter().map(|s| SeedTarget::from_path(*s)).collect(),
        start,
    }
}

fn listing_page(url: &str, items: &[(&str, &str)], with_next: bool) -> FakePage {
    let mut html = String::from("<html><body>");
    for (title, href) in items {
        html.push_str(&format!(
            r#"<div class="product-item"><span class="product-title">{title}</span><a class="thumb" href="{href}">x</a></div>"#
        ));
    }
    if with_next {
        html.push_str(r#"<a href="/page/next">Next</a>"#);
    }
    html.push_str("</body></html>");
    FakePage {
        url: url.to_string(),
        html,
    }
}

fn detail_page(url: &str, description: &str) -> FakePage {
    FakePage {
        url: url.to_string(),
        html: format!(
            r#"<html><body><div class="panel-body"><h1>Description</h1><p>{description}</p></div></body></html>"#
        ),
    }
}

fn artifact_records(dir: &Path) -> Vec<Record> {
    let raw = std::fs::read_to_string(dir.join("products.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn paginated_run_captures_all_pages_then_exhausts() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        listing_page(
            "http://market.onion/shop",
            &[("Alpha", "/p/1"), ("Beta", "/p/2")],
            true,
        ),
        listing_page("http://market.onion/page/2", &[("Gamma", "/p/3")], false),
    ];
    let (driver, state) = ScriptedDriver::new(pages);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.captured, 3);
    assert_eq!(summary.pages_visited, 2);

    // The final page's records were persisted before exhaustion.
    let records = artifact_records(dir.path());
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].get("title"), Some("Gamma"));
    assert_eq!(records[2].target_url(), Some("http://market.onion/p/3"));

    // Log cleared, session released.
    assert!(!dir.path().join("capture.jsonl").exists());
    assert!(state.lock().unwrap().closed);
    assert_eq!(state.lock().unwrap().clicks, 1);
}

#[tokio::test]
async fn duplicate_items_on_a_page_are_admitted_once() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![listing_page(
        "http://market.onion/shop",
        &[("Alpha", "/p/1"), ("Alpha again", "/p/1")],
        false,
    )];
    let (driver, _state) = ScriptedDriver::new(pages);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.captured, 1);
    assert_eq!(summary.duplicates_skipped, 1);
    let records = artifact_records(dir.path());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some("Alpha"));
}

#[tokio::test]
async fn item_without_a_link_is_dropped_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let mut page = listing_page("http://market.onion/shop", &[("Alpha", "/p/1")], false);
    page.html = page.html.replace(
        "</body>",
        r#"<div class="product-item"><span class="product-title">Linkless</span></div></body>"#,
    );
    let (driver, _state) = ScriptedDriver::new(vec![page]);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.captured, 1);
    let records = artifact_records(dir.path());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some("Alpha"));
}

#[tokio::test]
async fn item_cap_stops_after_current_page_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        listing_page(
            "http://market.onion/shop",
            &[("Alpha", "/p/1"), ("Beta", "/p/2")],
            true,
        ),
        listing_page("http://market.onion/page/2", &[("Gamma", "/p/3")], false),
    ];
    let (driver, state) = ScriptedDriver::new(pages);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(2, Some(2)),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::CapReached);
    assert_eq!(summary.captured, 2);
    // The next page was never requested.
    assert_eq!(state.lock().unwrap().clicks, 0);
}

#[tokio::test]
async fn bounded_run_resumes_without_refetching_finalized_items() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        detail_page("http://market.onion/p/1", "first"),
        detail_page("http://market.onion/p/2", "second"),
    ];

    // Run 1 captures everything and finalizes.
    let (driver, _state) = ScriptedDriver::new(pages.clone());
    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), product_extractor(), 1),
        bounded_mode(&["p/1", "p/2"], 0),
        "div.panel-body".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();
    let summary = controller.run().await.unwrap();
    assert_eq!(summary.captured, 2);

    // Run 2 over the same seeds touches the network zero times.
    let (driver, state) = ScriptedDriver::new(pages);
    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), product_extractor(), 1),
        bounded_mode(&["p/1", "p/2"], 0),
        "div.panel-body".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();
    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.captured, 0);
    assert_eq!(summary.duplicates_skipped, 2);
    assert_eq!(state.lock().unwrap().navigations, 0);

    // No duplicate target identifiers in the artifact.
    let records = artifact_records(dir.path());
    let mut urls: Vec<_> = records.iter().filter_map(Record::target_url).collect();
    urls.sort_unstable();
    urls.dedup();
    assert_eq!(records.len(), urls.len());
}

#[tokio::test]
async fn bounded_run_resumes_from_checkpoint_log() {
    let dir = tempfile::tempdir().unwrap();

    // A previous run checkpointed p/1 but never finalized.
    {
        let mut store = open_store(dir.path());
        let mut record = Record::new();
        record.set("url", "http://market.onion/p/1");
        record.set("description", "first");
        store.append(record).unwrap();
    }

    let pages = vec![
        detail_page("http://market.onion/p/1", "first"),
        detail_page("http://market.onion/p/2", "second"),
    ];
    let (driver, state) = ScriptedDriver::new(pages);
    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), product_extractor(), 1),
        bounded_mode(&["p/1", "p/2"], 0),
        "div.panel-body".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.captured, 1);
    assert_eq!(summary.duplicates_skipped, 1);

    let records = artifact_records(dir.path());
    let urls: Vec<_> = records.iter().filter_map(Record::target_url).collect();
    assert_eq!(
        urls,
        vec!["http://market.onion/p/1", "http://market.onion/p/2"]
    );
    // Only the un-captured seed was fetched.
    assert!(state.lock().unwrap().navigations >= 1);
}

#[tokio::test]
async fn circuit_breaker_trips_even_if_next_attempt_would_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![detail_page("http://market.onion/p/1", "fine")];
    let (driver, state) = ScriptedDriver::new(pages);
    // Three navigator attempts per fetch, ceiling of three fetch cycles:
    // exactly nine timeouts, so the tenth navigation would have worked.
    state.lock().unwrap().nav_timeouts = 9;

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), product_extractor(), 1),
        bounded_mode(&["p/1"], 0),
        "div.panel-body".to_string(),
        limits(3, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::FailureCeiling);
    assert_eq!(summary.captured, 0);
    assert_eq!(state.lock().unwrap().navigations, 9);
    assert!(state.lock().unwrap().closed);
}

#[tokio::test]
async fn blocked_page_rotates_identity_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let control_port = permissive_control_port().await;
    let pages = vec![
        listing_page("http://market.onion/shop", &[("Alpha", "/p/1")], true),
        listing_page("http://market.onion/page/2", &[("Beta", "/p/2")], false),
    ];
    let (driver, state) = ScriptedDriver::new(pages);
    state.lock().unwrap().blocked_navigations = 1;

    let controller = PaginationController::new(
        services(
            driver,
            open_store(dir.path()),
            listing_extractor(),
            control_port,
        ),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(3, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.captured, 2);

    let state = state.lock().unwrap();
    // Rotation cleared cookies and the page was re-fetched.
    assert_eq!(state.cookies_cleared, 1);
    assert!(state.navigations >= 2);
}

#[tokio::test]
async fn failed_rotation_terminates_with_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        listing_page("http://market.onion/shop", &[("Alpha", "/p/1")], true),
        listing_page("http://market.onion/page/2", &[("Beta", "/p/2")], false),
    ];
    let (driver, state) = ScriptedDriver::new(pages);
    // Page two comes back blocked; the control port is unreachable.
    state.lock().unwrap().blocked_navigations = 0;

    let controller = PaginationController::new(
        services(driver.clone(), open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(5, None),
        cancel_flag(),
    )
    .unwrap();

    // Make the second page blocked by swapping its content after start.
    {
        let mut s = state.lock().unwrap();
        s.pages[1].html = BLOCKED_HTML.to_string();
    }

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::RotationFailed);
    // First page's records were still finalized.
    assert_eq!(summary.captured, 1);
    let records = artifact_records(dir.path());
    assert_eq!(records.len(), 1);
    assert!(state.lock().unwrap().closed);
}

#[tokio::test]
async fn preset_interrupt_terminates_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![listing_page("http://market.onion/shop", &[("Alpha", "/p/1")], false)];
    let (driver, state) = ScriptedDriver::new(pages);

    let cancel = cancel_flag();
    cancel.store(true, std::sync::atomic::Ordering::Relaxed);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), listing_extractor(), 1),
        listing_mode("http://market.onion/shop"),
        ".product-item".to_string(),
        limits(2, None),
        cancel,
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.captured, 0);
    // The release path still ran.
    assert!(state.lock().unwrap().closed);
    assert!(summary.artifact.exists());
}

#[tokio::test]
async fn start_offset_skips_leading_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let pages = vec![
        detail_page("http://market.onion/p/1", "first"),
        detail_page("http://market.onion/p/2", "second"),
        detail_page("http://market.onion/p/3", "third"),
    ];
    let (driver, _state) = ScriptedDriver::new(pages);

    let controller = PaginationController::new(
        services(driver, open_store(dir.path()), product_extractor(), 1),
        bounded_mode(&["p/1", "p/2", "p/3"], 2),
        "div.panel-body".to_string(),
        limits(2, None),
        cancel_flag(),
    )
    .unwrap();

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.captured, 1);
    let records = artifact_records(dir.path());
    assert_eq!(records[0].target_url(), Some("http://market.onion/p/3"));
}

#[tokio::test]
async fn rotation_succeeds_through_navigator_cookie_clearing() {
    let control_port = permissive_control_port().await;
    let pages = vec![detail_page("http://market.onion/p/1", "x")];
    let (driver, state) = ScriptedDriver::new(pages);

    let sleeper: Arc<dyn Sleeper> = Arc::new(NoopSleeper);
    let navigator = Navigator::new(
        Box::new(driver),
        &NavigationConfig::default(),
        BackoffScheduler::default(),
        sleeper.clone(),
    );
    let proxy = ProxyConfig {
        host: "127.0.0.1".into(),
        socks_port: 1,
        control_port,
    };
    let rotator = IdentityRotator::new(&proxy, Duration::ZERO, sleeper);

    assert!(rotator.rotate(&navigator).await);
    assert_eq!(state.lock().unwrap().cookies_cleared, 1);
}
