//! Crawl orchestration: the pagination state machine.
//!
//! The controller drives one browser session across a crawl run, one page at
//! a time: load, check for blocking, extract, dedup, persist, advance. Two
//! modes share the machine: a bounded crawl over a pre-enumerated seed list
//! (one record per known URL) and an open-ended paginated crawl over a
//! listing (one record per repeating item, "Next" control to advance).
//!
//! Recovery policy lives here too: transient failures retry in place,
//! detected blocks rotate the network identity and refresh, and a small
//! consecutive-failure ceiling acts as a hard circuit breaker against retry
//! storms. Termination is absorbing — whatever was checkpointed is always
//! finalized and the browser session always released, on success, failure,
//! and interrupt alike.

mod next;

pub use next::{NextPageLocator, NextPageStrategy};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scraper::Selector;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{Navigator, PageSnapshot};
use crate::detect::BlockDetector;
use crate::error::{EngineError, ErrorKind};
use crate::extract::FieldExtractor;
use crate::identity::IdentityRotator;
use crate::pacing::{BackoffScheduler, Sleeper};
use crate::record::Record;
use crate::seed::SeedTarget;
use crate::store::CheckpointStore;

/// What to crawl.
pub enum CrawlMode {
    /// Visit each seed URL once; one record per seed.
    Bounded {
        base_url: String,
        seeds: Vec<SeedTarget>,
        /// Skip this many seeds before starting.
        start: usize,
    },
    /// Walk a listing page by page until no next-page control matches.
    Paginated {
        start_url: String,
        /// Repeating item container on each listing page.
        item_selector: String,
        /// Ordered next-page strategies; first match wins.
        next: Vec<NextPageStrategy>,
    },
}

/// Position in the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Index into the seed list (bounded mode).
    Index(usize),
    /// Listing page counter, 1-based (paginated mode).
    Page(u32),
}

/// Mutable run state, owned exclusively by the controller.
#[derive(Debug, Clone)]
pub struct CrawlState {
    pub cursor: Cursor,
    pub consecutive_failures: u32,
    pub captured_this_run: u64,
}

/// Run bounds.
#[derive(Debug, Clone)]
pub struct CrawlLimits {
    /// Stop after capturing this many items this run.
    pub max_items: Option<u64>,
    /// Consecutive-failure ceiling; reaching it forces termination.
    pub failure_ceiling: u32,
}

impl Default for CrawlLimits {
    fn default() -> Self {
        Self {
            max_items: None,
            failure_ceiling: 2,
        }
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No more work: seed list finished or no next-page control matched.
    Exhausted,
    /// The configured item cap was reached.
    CapReached,
    /// An operator interrupt was observed.
    Cancelled,
    /// The consecutive-failure ceiling tripped.
    FailureCeiling,
    /// Blocked, and a new identity could not be obtained.
    RotationFailed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "exhausted"),
            Self::CapReached => write!(f, "item cap reached"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::FailureCeiling => write!(f, "failure ceiling"),
            Self::RotationFailed => write!(f, "identity rotation failed"),
        }
    }
}

/// Final accounting for a completed run.
#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub captured: u64,
    pub duplicates_skipped: u64,
    pub pages_visited: u32,
    pub artifact: PathBuf,
}

/// The services the controller orchestrates. All small-state or stateless;
/// the controller is the only component that mutates run state.
pub struct CrawlServices {
    pub navigator: Navigator,
    pub extractor: FieldExtractor,
    pub detector: BlockDetector,
    pub rotator: IdentityRotator,
    pub scheduler: BackoffScheduler,
    pub sleeper: Arc<dyn Sleeper>,
    pub store: CheckpointStore,
}

enum ModeState {
    Bounded {
        base_url: String,
        seeds: Vec<SeedTarget>,
        pending_url: Option<String>,
    },
    Paginated {
        start_url: String,
        item_selector: Selector,
        locator: NextPageLocator,
    },
}

enum Phase {
    Idle,
    Loading,
    Extracting(PageSnapshot),
    Deduping(Vec<Record>),
    Advancing,
    Blocked,
    Exhausted,
}

enum Step {
    Continue(Phase),
    Done(RunOutcome),
}

enum LoadPlan {
    Exhausted,
    Fetch(String),
    Refresh,
    Snapshot,
}

type ProgressFn = Box<dyn Fn(u64, &str) + Send + Sync>;

/// Top-level state machine driving one crawl run.
pub struct PaginationController {
    services: CrawlServices,
    mode_state: ModeState,
    marker: String,
    limits: CrawlLimits,
    cancel: Arc<AtomicBool>,
    on_captured: Option<ProgressFn>,
    state: CrawlState,
    duplicates: u64,
    pages_visited: u32,
    needs_refresh: bool,
    cap_reached: bool,
}

impl PaginationController {
    /// Build a controller. Selector-shaped configuration is compiled here so
    /// bad config fails before any navigation.
    pub fn new(
        services: CrawlServices,
        mode: CrawlMode,
        marker: String,
        limits: CrawlLimits,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let (mode_state, cursor) = match mode {
            CrawlMode::Bounded {
                base_url,
                seeds,
                start,
            } => (
                ModeState::Bounded {
                    base_url,
                    seeds,
                    pending_url: None,
                },
                Cursor::Index(start),
            ),
            CrawlMode::Paginated {
                start_url,
                item_selector,
                next,
            } => {
                let item_selector = Selector::parse(&item_selector).map_err(|e| {
                    anyhow::anyhow!("bad item selector '{item_selector}': {e}")
                })?;
                let locator = NextPageLocator::compile(&next)?;
                (
                    ModeState::Paginated {
                        start_url,
                        item_selector,
                        locator,
                    },
                    Cursor::Page(1),
                )
            }
        };

        Ok(Self {
            services,
            mode_state,
            marker,
            limits,
            cancel,
            on_captured: None,
            state: CrawlState {
                cursor,
                consecutive_failures: 0,
                captured_this_run: 0,
            },
            duplicates: 0,
            pages_visited: 0,
            needs_refresh: false,
            cap_reached: false,
        })
    }

    /// Invoke a callback after every captured record (progress display).
    pub fn with_progress(mut self, on_captured: ProgressFn) -> Self {
        self.on_captured = Some(on_captured);
        self
    }

    /// Drive the run to termination. Always releases the browser session and
    /// finalizes whatever was checkpointed, whichever way the run ends.
    pub async fn run(mut self) -> Result<RunSummary, EngineError> {
        let driven = self.drive().await;

        self.services.navigator.close().await;
        let finalized = self.services.store.finalize();

        match driven {
            Ok(outcome) => {
                let artifact = finalized?;
                info!(
                    "run ended ({}): {} captured, {} duplicates skipped, {} pages",
                    outcome, self.state.captured_this_run, self.duplicates, self.pages_visited
                );
                Ok(RunSummary {
                    outcome,
                    captured: self.state.captured_this_run,
                    duplicates_skipped: self.duplicates,
                    pages_visited: self.pages_visited,
                    artifact,
                })
            }
            Err(e) => {
                match finalized {
                    Ok(artifact) => warn!(
                        "run failed; {} records already captured are in {}",
                        self.state.captured_this_run,
                        artifact.display()
                    ),
                    Err(fe) => warn!("run failed and finalize failed too: {}", fe),
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<RunOutcome, EngineError> {
        let mut phase = Phase::Idle;
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("interrupt observed; terminating");
                return Ok(RunOutcome::Cancelled);
            }
            let step = match phase {
                Phase::Idle => Step::Continue(Phase::Loading),
                Phase::Loading => self.load().await?,
                Phase::Extracting(page) => self.extract(page),
                Phase::Deduping(records) => self.dedupe(records)?,
                Phase::Advancing => self.advance().await?,
                Phase::Blocked => self.recover().await?,
                Phase::Exhausted => {
                    return Ok(if self.cap_reached {
                        RunOutcome::CapReached
                    } else {
                        RunOutcome::Exhausted
                    });
                }
            };
            phase = match step {
                Step::Continue(next) => next,
                Step::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn load(&mut self) -> Result<Step, EngineError> {
        let first_listing_load =
            matches!(self.mode_state, ModeState::Paginated { .. }) && self.pages_visited == 0;

        let plan = match &mut self.mode_state {
            ModeState::Bounded {
                base_url,
                seeds,
                pending_url,
            } => {
                self.needs_refresh = false;
                let mut index = match self.state.cursor {
                    Cursor::Index(i) => i,
                    Cursor::Page(_) => unreachable!("bounded mode uses an index cursor"),
                };
                loop {
                    match seeds.get(index) {
                        None => {
                            self.state.cursor = Cursor::Index(index);
                            break LoadPlan::Exhausted;
                        }
                        Some(seed) => {
                            let url = seed.resolve_url(base_url);
                            if self.services.store.contains(&url) {
                                debug!("already captured, skipping {}", url);
                                self.duplicates += 1;
                                index += 1;
                                continue;
                            }
                            self.state.cursor = Cursor::Index(index);
                            *pending_url = Some(url.clone());
                            break LoadPlan::Fetch(url);
                        }
                    }
                }
            }
            ModeState::Paginated { start_url, .. } => {
                if self.pages_visited == 0 {
                    self.needs_refresh = false;
                    LoadPlan::Fetch(start_url.clone())
                } else if self.needs_refresh {
                    self.needs_refresh = false;
                    LoadPlan::Refresh
                } else {
                    LoadPlan::Snapshot
                }
            }
        };

        let marker = self.marker.clone();
        let fetched = match plan {
            LoadPlan::Exhausted => return Ok(Step::Continue(Phase::Exhausted)),
            LoadPlan::Fetch(url) => self.services.navigator.fetch(&url, &marker).await,
            LoadPlan::Refresh => self.services.navigator.refresh(&marker).await,
            LoadPlan::Snapshot => self.services.navigator.snapshot().await,
        };

        match fetched {
            Ok(page) => {
                if first_listing_load {
                    let settle = self.services.scheduler.settle_delay();
                    self.services.sleeper.sleep(settle).await;
                }
                if self.blocked_page(&page.html) {
                    warn!("block indicators on {}", page.url);
                    Ok(Step::Continue(Phase::Blocked))
                } else {
                    Ok(Step::Continue(Phase::Extracting(page)))
                }
            }
            Err(e) => self.handle_load_error(e).await,
        }
    }

    fn extract(&mut self, page: PageSnapshot) -> Step {
        self.pages_visited += 1;
        match &self.mode_state {
            ModeState::Bounded {
                seeds, pending_url, ..
            } => {
                let index = match self.state.cursor {
                    Cursor::Index(i) => i,
                    Cursor::Page(_) => unreachable!("bounded mode uses an index cursor"),
                };
                // Key the record by the pre-known URL, not whatever the page
                // redirected to; the dedup key must be stable across runs.
                let url = pending_url.clone().unwrap_or_else(|| page.url.clone());
                let known = seeds
                    .get(index)
                    .map(|seed| seed.known_fields.clone())
                    .unwrap_or_default();
                let record = self
                    .services
                    .extractor
                    .extract_detail(&page.html, &url, &known);
                Step::Continue(Phase::Deduping(vec![record]))
            }
            ModeState::Paginated { item_selector, .. } => {
                let records =
                    self.services
                        .extractor
                        .extract_listing(&page.html, &page.url, item_selector);
                if records.is_empty() {
                    match self.services.store.dump_error_page(&page.html) {
                        Ok(path) => warn!(
                            "no items on {}; raw page dumped to {}",
                            page.url,
                            path.display()
                        ),
                        Err(e) => warn!("no items on {} (page dump failed: {})", page.url, e),
                    }
                    return Step::Continue(Phase::Blocked);
                }
                debug!("extracted {} items from {}", records.len(), page.url);
                Step::Continue(Phase::Deduping(records))
            }
        }
    }

    fn dedupe(&mut self, records: Vec<Record>) -> Result<Step, EngineError> {
        for record in records {
            let Some(url) = record.target_url().map(str::to_string) else {
                warn!("dropping record without a target URL");
                continue;
            };
            // A sentinel or relative leftover cannot serve as a dedup key.
            if Url::parse(&url).is_err() {
                warn!("dropping record with unusable target URL '{}'", url);
                continue;
            }
            if self.services.store.contains(&url) {
                self.duplicates += 1;
                continue;
            }
            let ordinal = self.services.store.append(record)?;
            self.state.captured_this_run += 1;
            debug!("captured #{} {}", ordinal, url);
            if let Some(on_captured) = &self.on_captured {
                on_captured(self.state.captured_this_run, &url);
            }
        }
        // A fully successful page/item cycle is the only thing that resets
        // the failure streak.
        self.state.consecutive_failures = 0;
        Ok(Step::Continue(Phase::Advancing))
    }

    async fn advance(&mut self) -> Result<Step, EngineError> {
        if let Some(cap) = self.limits.max_items {
            if self.state.captured_this_run >= cap {
                info!("item cap ({}) reached", cap);
                self.cap_reached = true;
                return Ok(Step::Continue(Phase::Exhausted));
            }
        }

        if matches!(self.mode_state, ModeState::Paginated { .. }) {
            return self.advance_listing().await;
        }

        if let ModeState::Bounded {
            seeds, pending_url, ..
        } = &mut self.mode_state
        {
            *pending_url = None;
            let index = match self.state.cursor {
                Cursor::Index(i) => i,
                Cursor::Page(_) => unreachable!("bounded mode uses an index cursor"),
            };
            self.state.cursor = Cursor::Index(index + 1);
            if index + 1 >= seeds.len() {
                return Ok(Step::Continue(Phase::Exhausted));
            }
        }

        let pace = self.services.scheduler.pace_delay();
        self.services.sleeper.sleep(pace).await;
        Ok(Step::Continue(Phase::Loading))
    }

    /// Locate the next-page control, click it, and wait for the next listing
    /// to render. No matching control means the listing is exhausted — only
    /// reached after the current page's records were persisted.
    async fn advance_listing(&mut self) -> Result<Step, EngineError> {
        let page = match self.services.navigator.snapshot().await {
            Ok(page) => page,
            Err(e) => return self.handle_load_error(e).await,
        };

        let script = {
            let ModeState::Paginated { locator, .. } = &self.mode_state else {
                unreachable!("advance_listing only runs in paginated mode");
            };
            match locator.locate(&page.html) {
                None => {
                    info!("no next-page control matched; listing exhausted");
                    return Ok(Step::Continue(Phase::Exhausted));
                }
                Some(target) => {
                    debug!("advancing via {}", target.describe());
                    target.click_script()
                }
            }
        };

        let clicked = match self.services.navigator.execute_script(&script).await {
            Ok(value) => value,
            Err(e) => return self.handle_load_error(e).await,
        };
        if clicked != Value::Bool(true) {
            warn!("next-page control vanished before it could be clicked");
            return Ok(self.note_failure().await);
        }

        let marker = self.marker.clone();
        if let Err(e) = self.services.navigator.await_marker(&marker).await {
            return self.handle_load_error(e).await;
        }

        if let Cursor::Page(n) = self.state.cursor {
            self.state.cursor = Cursor::Page(n + 1);
        }

        let pace = self.services.scheduler.pace_delay();
        self.services.sleeper.sleep(pace).await;
        Ok(Step::Continue(Phase::Loading))
    }

    /// Blocked: rotate identity and retry the current position, within the
    /// failure ceiling. Rotation failure ends the run.
    async fn recover(&mut self) -> Result<Step, EngineError> {
        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures >= self.limits.failure_ceiling {
            warn!(
                "failure ceiling ({}) reached while blocked",
                self.limits.failure_ceiling
            );
            return Ok(Step::Done(RunOutcome::FailureCeiling));
        }

        info!("rotating network identity");
        if self
            .services
            .rotator
            .rotate(&self.services.navigator)
            .await
        {
            self.needs_refresh = true;
            Ok(Step::Continue(Phase::Loading))
        } else {
            warn!("could not obtain a new identity");
            Ok(Step::Done(RunOutcome::RotationFailed))
        }
    }

    /// Shared policy for errors while loading or advancing: fatal errors
    /// propagate, a failed readiness precondition is re-examined for
    /// blocking, everything else counts against the failure ceiling.
    async fn handle_load_error(&mut self, e: EngineError) -> Result<Step, EngineError> {
        match e.kind() {
            ErrorKind::Fatal => Err(e),
            ErrorKind::Blocking => Ok(Step::Continue(Phase::Blocked)),
            ErrorKind::Transient => {
                if matches!(e, EngineError::PreconditionFailed { .. }) {
                    if let Ok(snapshot) = self.services.navigator.snapshot().await {
                        if self.blocked_page(&snapshot.html) {
                            warn!("{e}; page content looks blocked");
                            return Ok(Step::Continue(Phase::Blocked));
                        }
                    }
                }
                warn!("{e}");
                Ok(self.note_failure().await)
            }
        }
    }

    async fn note_failure(&mut self) -> Step {
        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures >= self.limits.failure_ceiling {
            warn!(
                "failure ceiling ({}) reached",
                self.limits.failure_ceiling
            );
            return Step::Done(RunOutcome::FailureCeiling);
        }
        let delay = self
            .services
            .scheduler
            .retry_delay(self.state.consecutive_failures);
        self.services.sleeper.sleep(delay).await;
        Step::Continue(Phase::Loading)
    }

    fn blocked_page(&self, html: &str) -> bool {
        match &self.mode_state {
            ModeState::Bounded { .. } => self.services.detector.content_blocked(html),
            ModeState::Paginated { item_selector, .. } => {
                self.services.detector.is_blocked(html, Some(item_selector))
            }
        }
    }
}
