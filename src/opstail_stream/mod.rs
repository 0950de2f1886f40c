//! Stream controller for one viewer: infinite-scroll fetcher, live-tail poll
//! gating, trim controller and filter lifecycle.
//!
//! [`LogStream`] is a synchronous state machine. Every input returns the
//! fetch commands to run; results come back through
//! [`LogStream::on_fetch_complete`]. [`driver`] runs it on tokio.

pub mod driver;
mod view;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::opstail_cache::{MergeOutcome, PageCache};
use crate::opstail_core::{Cursor, FilterKey, Filters, LogEntry, Period, StreamKind, Timestamp};
use crate::opstail_protocol::{FetchError, Page, PageAnchor, PageRequest, DEFAULT_PAGE_LIMIT};

pub use driver::{StreamDriver, StreamHandle, StreamInput};
pub use view::{ScrollMetrics, ViewState};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_NEAR_BOTTOM_THRESHOLD: f64 = 200.0;
pub const DEFAULT_CURSOR_MAX_AGE: Duration = Duration::from_millis(30_000);

pub type Clock = fn() -> Timestamp;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub page_limit: usize,
    pub poll_interval: Duration,
    pub near_bottom_threshold: f64,
    pub cursor_max_age: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            near_bottom_threshold: DEFAULT_NEAR_BOTTOM_THRESHOLD,
            cursor_max_age: DEFAULT_CURSOR_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    /// Cursorless newest page, merged as the new head.
    Head,
    /// Entries newer than the backward cursor, merged as the new head.
    Newer,
    /// Next older page, appended.
    Older,
}

/// Identifies a fetch so that its result can be matched against the cache
/// state it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub generation: u64,
    pub epoch: u64,
    pub id: u64,
    pub purpose: FetchPurpose,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCommand {
    pub ticket: Ticket,
    pub filters: Filters,
    pub request: PageRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Merged(MergeOutcome),
    Failed(FetchError),
    /// The result belongs to a replaced cache or a trimmed page chain.
    Discarded,
}

/// Immutable view handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub generation: u64,
    pub entries: Arc<[LogEntry]>,
    pub total: u64,
    pub page_count: usize,
    pub has_more: bool,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub view: ViewState,
    pub live: bool,
    pub error: Option<FetchError>,
}

/// Everything a [`StreamSnapshot`] is derived from, without the entries.
/// Equal stamps mean equal snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotStamp {
    generation: u64,
    revision: u64,
    is_loading: bool,
    is_fetching: bool,
    view: ViewState,
    live: bool,
    error: Option<FetchError>,
}

pub struct LogStream {
    filters: Filters,
    key: FilterKey,
    cache: PageCache,
    config: StreamConfig,
    clock: Clock,
    live: bool,
    view: ViewState,
    at_top: bool,
    anchor: Timestamp,
    generation: u64,
    epoch: u64,
    next_id: u64,
    head_in_flight: Option<u64>,
    older_in_flight: Option<u64>,
    loaded: bool,
    last_error: Option<FetchError>,
}

impl LogStream {
    pub fn new(filters: Filters, live: bool, config: StreamConfig) -> Self {
        Self::with_clock(filters, live, config, Utc::now)
    }

    pub fn with_clock(filters: Filters, live: bool, config: StreamConfig, clock: Clock) -> Self {
        let key = filters.key();
        Self {
            cache: PageCache::new(key.clone()),
            key,
            filters,
            config,
            clock,
            live,
            view: ViewState::Initial,
            at_top: true,
            anchor: clock(),
            generation: 0,
            epoch: 0,
            next_id: 0,
            head_in_flight: None,
            older_in_flight: None,
            loaded: false,
            last_error: None,
        }
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn live(&self) -> bool {
        self.live_active()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        !self.loaded && self.head_in_flight.is_some()
    }

    pub fn is_fetching(&self) -> bool {
        self.head_in_flight.is_some() || self.older_in_flight.is_some()
    }

    /// The poller runs only while this holds.
    pub fn poll_due(&self) -> bool {
        self.live_active() && self.view == ViewState::LiveAtEdge
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            generation: self.generation,
            entries: Arc::from(self.cache.flattened()),
            total: self.cache.total(),
            page_count: self.cache.pages().len(),
            has_more: self.cache.has_more(),
            is_loading: self.is_loading(),
            is_fetching: self.is_fetching(),
            view: self.view,
            live: self.live_active(),
            error: self.last_error.clone(),
        }
    }

    pub fn snapshot_stamp(&self) -> SnapshotStamp {
        SnapshotStamp {
            generation: self.generation,
            revision: self.cache.revision(),
            is_loading: self.is_loading(),
            is_fetching: self.is_fetching(),
            view: self.view,
            live: self.live_active(),
            error: self.last_error.clone(),
        }
    }

    /// Leaves `Initial` and issues the first head fetch.
    pub fn mount(&mut self) -> Vec<FetchCommand> {
        if self.view != ViewState::Initial {
            return Vec::new();
        }
        self.view = if self.live_active() { ViewState::LiveAtEdge } else { ViewState::Historical };
        info!(
            generation = self.generation,
            view = self.view.label(),
            scope = self.filters.kind.endpoint(),
            "mounted stream"
        );
        self.issue(FetchPurpose::Head, PageAnchor::Head).into_iter().collect()
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> Vec<FetchCommand> {
        let at_top = metrics.is_at_top();
        self.at_top = at_top;

        let mut commands = Vec::new();
        match self.view {
            ViewState::LiveAtEdge if !at_top => {
                self.view = ViewState::LiveScrolled;
                debug!(generation = self.generation, "left live edge");
            }
            ViewState::LiveScrolled if at_top => {
                self.view = ViewState::LiveAtEdge;
                commands.extend(self.return_to_edge());
            }
            _ => {}
        }
        commands.extend(self.maybe_fetch_more(metrics));
        commands
    }

    pub fn maybe_fetch_more(&mut self, metrics: ScrollMetrics) -> Option<FetchCommand> {
        if !metrics.is_near_bottom(self.config.near_bottom_threshold) {
            return None;
        }
        self.fetch_more()
    }

    /// Requests the next older page unless one is in flight or nothing is left.
    pub fn fetch_more(&mut self) -> Option<FetchCommand> {
        if self.view == ViewState::Initial || self.older_in_flight.is_some() || !self.cache.has_more() {
            return None;
        }
        let cursor = self.cache.forward_cursor()?.clone();
        self.issue(FetchPurpose::Older, PageAnchor::Older(cursor))
    }

    pub fn on_poll_tick(&mut self) -> Option<FetchCommand> {
        if !self.poll_due() {
            debug!(view = self.view.label(), "poll tick gated");
            return None;
        }
        match (&self.filters.kind, self.reusable_backward_cursor()) {
            (StreamKind::Messages { .. }, Some(cursor)) => {
                self.issue(FetchPurpose::Newer, PageAnchor::Newer(cursor))
            }
            _ => self.issue(FetchPurpose::Head, PageAnchor::Head),
        }
    }

    pub fn set_live(&mut self, live: bool) -> Vec<FetchCommand> {
        if self.live == live {
            return Vec::new();
        }
        self.live = live;
        if self.view == ViewState::Initial {
            return Vec::new();
        }
        if !live {
            self.view = ViewState::Historical;
            info!(generation = self.generation, "live mode disabled");
            return Vec::new();
        }
        if !self.live_active() {
            warn!("absolute time window cannot be followed live");
            return Vec::new();
        }
        if self.at_top {
            self.view = ViewState::LiveAtEdge;
            self.return_to_edge()
        } else {
            self.view = ViewState::LiveScrolled;
            Vec::new()
        }
    }

    /// Replaces the cache when the normalized filter key changes.
    pub fn set_filters(&mut self, filters: Filters) -> Vec<FetchCommand> {
        let key = filters.key();
        if key == self.key {
            debug!("filters unchanged");
            return Vec::new();
        }
        self.generation += 1;
        info!(
            generation = self.generation,
            discarded = self.cache.len(),
            "filters changed, starting a new cache"
        );
        self.filters = filters;
        self.cache = PageCache::new(key.clone());
        self.key = key;
        self.view = ViewState::Initial;
        self.at_top = true;
        self.anchor = (self.clock)();
        self.epoch = 0;
        self.head_in_flight = None;
        self.older_in_flight = None;
        self.loaded = false;
        self.last_error = None;
        self.mount()
    }

    /// Applies a fetch result. Returns what happened plus any follow-up fetches.
    pub fn on_fetch_complete(
        &mut self,
        ticket: Ticket,
        result: Result<Page, FetchError>,
    ) -> (Completion, Vec<FetchCommand>) {
        if ticket.generation != self.generation {
            debug!(
                ticket_generation = ticket.generation,
                generation = self.generation,
                "dropped result for replaced cache"
            );
            return (Completion::Discarded, Vec::new());
        }
        self.release(ticket);
        if ticket.purpose == FetchPurpose::Older && ticket.epoch != self.epoch {
            debug!(ticket_epoch = ticket.epoch, epoch = self.epoch, "dropped older page fetched before trim");
            return (Completion::Discarded, Vec::new());
        }

        match result {
            Ok(page) => {
                self.loaded = true;
                self.last_error = None;
                let outcome = match ticket.purpose {
                    FetchPurpose::Head => self.cache.replace_head(page),
                    FetchPurpose::Newer => self.cache.merge_newer(page),
                    FetchPurpose::Older => self.cache.append(page),
                };
                debug!(
                    purpose = ?ticket.purpose,
                    added = outcome.added,
                    len = outcome.len,
                    total = self.cache.total(),
                    "merged page"
                );
                (Completion::Merged(outcome), Vec::new())
            }
            Err(error) => {
                warn!(purpose = ?ticket.purpose, kind = error.kind(), %error, "fetch failed");
                let mut follow_up = Vec::new();
                if error.is_stale_cursor() {
                    match ticket.purpose {
                        FetchPurpose::Older => follow_up.extend(self.restart_paging()),
                        FetchPurpose::Newer => self.cache.clear_backward_cursor(),
                        FetchPurpose::Head => {}
                    }
                }
                self.last_error = Some(error.clone());
                (Completion::Failed(error), follow_up)
            }
        }
    }

    fn live_active(&self) -> bool {
        self.live && !self.filters.window.is_absolute()
    }

    fn return_to_edge(&mut self) -> Vec<FetchCommand> {
        let dropped_pages = self.cache.trim();
        self.epoch += 1;
        self.older_in_flight = None;
        info!(
            generation = self.generation,
            epoch = self.epoch,
            dropped_pages,
            len = self.cache.len(),
            "returned to live edge"
        );
        self.issue(FetchPurpose::Head, PageAnchor::Head).into_iter().collect()
    }

    /// The cursor chain is gone: fall back to the head page and page again
    /// from the head fetch's forward cursor.
    fn restart_paging(&mut self) -> Option<FetchCommand> {
        let dropped_pages = self.cache.trim();
        self.cache.reset_pagination();
        self.epoch += 1;
        info!(
            generation = self.generation,
            epoch = self.epoch,
            dropped_pages,
            "older cursor rejected, paging from head"
        );
        self.issue(FetchPurpose::Head, PageAnchor::Head)
    }

    fn reusable_backward_cursor(&self) -> Option<Cursor> {
        let cursor = self.cache.backward_cursor()?;
        if self.filters.has_search() {
            return Some(cursor.clone());
        }
        let max_age = chrono::Duration::from_std(self.config.cursor_max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        if cursor.is_fresh((self.clock)(), max_age) {
            Some(cursor.clone())
        } else {
            debug!("backward cursor too old, refreshing from head");
            None
        }
    }

    fn query_period(&self) -> Period {
        let anchor = if self.live_active() { (self.clock)() } else { self.anchor };
        self.filters.window.resolve(anchor)
    }

    fn issue(&mut self, purpose: FetchPurpose, anchor: PageAnchor) -> Option<FetchCommand> {
        let busy = match purpose {
            FetchPurpose::Head | FetchPurpose::Newer => self.head_in_flight.is_some(),
            FetchPurpose::Older => self.older_in_flight.is_some(),
        };
        if busy {
            debug!(?purpose, "fetch already in flight");
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        match purpose {
            FetchPurpose::Head | FetchPurpose::Newer => self.head_in_flight = Some(id),
            FetchPurpose::Older => self.older_in_flight = Some(id),
        }
        let ticket = Ticket { generation: self.generation, epoch: self.epoch, id, purpose };
        let request = PageRequest { anchor, limit: self.config.page_limit, period: Some(self.query_period()) };
        Some(FetchCommand { ticket, filters: self.filters.clone(), request })
    }

    fn release(&mut self, ticket: Ticket) {
        let slot = match ticket.purpose {
            FetchPurpose::Head | FetchPurpose::Newer => &mut self.head_in_flight,
            FetchPurpose::Older => &mut self.older_in_flight,
        };
        if *slot == Some(ticket.id) {
            *slot = None;
        }
    }
}
