//! Windowed timeline cache: a bounded, date-grouped view over the paged
//! activity history, with lazily loaded per-activity detail.

pub mod window;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::FixedOffset;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TimelineConfig;
use crate::error::Result;
use crate::inflight::InFlightRegistry;
use crate::schema::{ActivityDetail, ActivityPatch, LoadDirection, PartialUpdateOutcome};
use crate::source::ActivitySource;
use crate::store::Store;

pub use window::{MergeReport, TimelineWindow};

/// Render-visible timeline state.
#[derive(Debug, Clone)]
pub struct TimelineState {
    pub window: TimelineWindow,
    pub error: Option<String>,
    pub loading: bool,
    pub loading_top: bool,
    pub loading_bottom: bool,
    /// Per-date totals across the whole history. Advisory only.
    pub day_counts: BTreeMap<String, usize>,
    pub details: HashMap<String, ActivityDetail>,
    pub loading_details: HashSet<String>,
    pub page_size: usize,
    /// Bumped by every `initialize`; page merges from an older generation are dropped.
    generation: u64,
}

impl TimelineState {
    fn new(max_days: usize, utc_offset: FixedOffset, page_size: usize) -> Self {
        Self {
            window: TimelineWindow::new(max_days, utc_offset),
            error: None,
            loading: false,
            loading_top: false,
            loading_bottom: false,
            day_counts: BTreeMap::new(),
            details: HashMap::new(),
            loading_details: HashSet::new(),
            page_size,
            generation: 0,
        }
    }

    /// Forget loaded and loading details of activities no longer in the window.
    fn prune_details(&mut self) {
        let window = &self.window;
        self.details.retain(|id, _| window.contains(id));
        self.loading_details.retain(|id| window.contains(id));
    }

    fn set_loading(&mut self, direction: LoadDirection, loading: bool) {
        match direction {
            LoadDirection::Top => self.loading_top = loading,
            LoadDirection::Bottom => self.loading_bottom = loading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(MergeReport),
    /// Nothing to do: a load is in flight, the edge is exhausted, or the window is empty.
    Skipped,
    /// The window was re-initialized while the page was in flight.
    Stale,
    Failed,
}

/// Owner of the timeline window. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TimelineStore {
    state: Store<TimelineState>,
    source: Arc<dyn ActivitySource>,
    loads: InFlightRegistry<LoadDirection>,
    detail_loads: InFlightRegistry<String>,
}

impl TimelineStore {
    pub fn new(source: Arc<dyn ActivitySource>, config: &TimelineConfig) -> Result<Self> {
        Ok(Self::with_window(
            source,
            config.max_days,
            config.utc_offset()?,
            config.page_size,
        ))
    }

    pub fn with_window(
        source: Arc<dyn ActivitySource>,
        max_days: usize,
        utc_offset: FixedOffset,
        page_size: usize,
    ) -> Self {
        Self {
            state: Store::new(TimelineState::new(max_days, utc_offset, page_size)),
            source,
            loads: InFlightRegistry::new(),
            detail_loads: InFlightRegistry::new(),
        }
    }

    pub fn snapshot(&self) -> TimelineState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    /// Discard the window and load the newest page.
    pub async fn initialize(&self, page_size: usize) -> LoadOutcome {
        let generation = self.state.update(|s| {
            s.generation += 1;
            s.loading = true;
            s.error = None;
            s.page_size = page_size;
            s.generation
        });

        let result = self.source.fetch_page(page_size, 0).await;

        let outcome = self.state.update_if(|s| {
            if s.generation != generation {
                return (LoadOutcome::Stale, false);
            }
            s.loading = false;
            match result {
                Ok(page) => {
                    let report = s.window.initialize(page.activities, page_size);
                    s.details.clear();
                    s.loading_details.clear();
                    (LoadOutcome::Loaded(report), true)
                }
                Err(e) => {
                    warn!("timeline initialize failed: {e}");
                    s.error = Some(e.to_string());
                    (LoadOutcome::Failed, true)
                }
            }
        });

        if let LoadOutcome::Loaded(report) = outcome {
            info!(
                fetched = report.fetched,
                days = self.state.read(|s| s.window.days().len()),
                "timeline initialized"
            );
            self.spawn_count_refresh();
        }
        outcome
    }

    /// Re-run `initialize` with the last page size.
    pub async fn refresh(&self) -> LoadOutcome {
        let page_size = self.state.read(|s| s.page_size);
        self.initialize(page_size).await
    }

    pub async fn load_more_top(&self, page_size: usize) -> LoadOutcome {
        self.load_more(LoadDirection::Top, page_size).await
    }

    pub async fn load_more_bottom(&self, page_size: usize) -> LoadOutcome {
        self.load_more(LoadDirection::Bottom, page_size).await
    }

    async fn load_more(&self, direction: LoadDirection, page_size: usize) -> LoadOutcome {
        let Some(_guard) = self.loads.try_acquire(direction) else {
            debug!(?direction, "load already in flight");
            return LoadOutcome::Skipped;
        };

        let start = self.state.update_if(|s| {
            if s.window.is_empty() || !s.window.has_more(direction) {
                return (None, false);
            }
            s.set_loading(direction, true);
            (Some((s.window.offset(direction), s.generation)), true)
        });
        let Some((offset, generation)) = start else {
            return LoadOutcome::Skipped;
        };

        let result = self.source.fetch_page(page_size, offset).await;

        self.state.update(|s| {
            s.set_loading(direction, false);
            if s.generation != generation {
                debug!(?direction, "dropping page fetched for a previous window");
                return LoadOutcome::Stale;
            }
            match result {
                Ok(page) => {
                    let report = s.window.merge_page(direction, page.activities, page_size);
                    if report.evicted_days > 0 {
                        s.prune_details();
                    }
                    debug!(
                        ?direction,
                        offset,
                        fetched = report.fetched,
                        added = report.added,
                        evicted_days = report.evicted_days,
                        "timeline page merged"
                    );
                    LoadOutcome::Loaded(report)
                }
                Err(e) => {
                    warn!(?direction, offset, "timeline page fetch failed: {e}");
                    s.error = Some(e.to_string());
                    LoadOutcome::Failed
                }
            }
        })
    }

    /// Apply a partial-update event. Updates for activities outside the
    /// window are stale noise and are ignored.
    pub fn apply_partial_update(
        &self,
        activity_id: &str,
        patch: &ActivityPatch,
    ) -> PartialUpdateOutcome {
        self.state.update_if(|s| {
            if !s.window.contains(activity_id) {
                debug!(activity_id, "ignoring update for activity outside the window");
                return (PartialUpdateOutcome::default(), false);
            }
            let outcome = s.window.apply_partial_update(activity_id, patch);
            if outcome.moved {
                debug!(activity_id, "activity moved to another day");
                s.prune_details();
            }
            (outcome, outcome.updated)
        })
    }

    /// Drop an activity from the window along with its detail markers.
    pub fn remove_activity(&self, activity_id: &str) -> bool {
        self.state.update_if(|s| {
            let removed = s.window.remove_activity(activity_id).is_some();
            let had_detail = s.details.remove(activity_id).is_some();
            let was_loading = s.loading_details.remove(activity_id);
            (removed, removed || had_detail || was_loading)
        })
    }

    /// Delete at the source, then drop the activity from the window.
    pub async fn delete_activity(&self, activity_id: &str) -> bool {
        match self.source.delete_activity(activity_id).await {
            Ok(deleted) => {
                if !deleted {
                    debug!(activity_id, "source had nothing to delete");
                }
                self.remove_activity(activity_id);
                deleted
            }
            Err(e) => {
                warn!(activity_id, "delete failed: {e}");
                self.state.update(|s| s.error = Some(e.to_string()));
                false
            }
        }
    }

    /// Load and cache the drill-down for an activity. Concurrent calls for
    /// the same id collapse into one fetch; later calls hit the cache.
    pub async fn load_detail(&self, activity_id: &str) -> Option<ActivityDetail> {
        if let Some(cached) = self.state.read(|s| s.details.get(activity_id).cloned()) {
            return Some(cached);
        }
        let _guard = self.detail_loads.try_acquire(activity_id.to_string())?;

        self.state.update(|s| {
            s.loading_details.insert(activity_id.to_string());
        });

        let result = self.source.fetch_detail(activity_id).await;

        self.state.update(|s| {
            let still_wanted = s.loading_details.remove(activity_id);
            match result {
                Ok(Some(detail)) => {
                    if !still_wanted || !s.window.contains(activity_id) {
                        debug!(activity_id, "activity left the window during detail load");
                        return None;
                    }
                    s.window
                        .set_event_summaries(activity_id, detail.summaries());
                    s.details.insert(activity_id.to_string(), detail.clone());
                    Some(detail)
                }
                Ok(None) => {
                    debug!(activity_id, "no detail for activity");
                    None
                }
                Err(e) => {
                    warn!(activity_id, "detail fetch failed: {e}");
                    s.error = Some(e.to_string());
                    None
                }
            }
        })
    }

    /// Fetch per-date totals. Failures are logged and never touch the window.
    pub async fn refresh_counts(&self) {
        match self.source.fetch_counts_by_date().await {
            Ok(counts) => {
                self.state.update(|s| s.day_counts = counts);
            }
            Err(e) => warn!("failed to fetch per-date counts: {e}"),
        }
    }

    fn spawn_count_refresh(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            store.refresh_counts().await;
        });
    }

    pub fn clear_error(&self) {
        self.state.update_if(|s| ((), s.error.take().is_some()));
    }
}
