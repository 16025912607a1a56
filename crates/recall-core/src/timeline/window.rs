use std::collections::HashSet;

use chrono::FixedOffset;

use crate::ingest::day_key;
use crate::schema::{
    Activity, ActivityPatch, EventSummary, LoadDirection, PartialUpdateOutcome, TimelineDay,
};

/// Bounded, date-grouped slice of the activity history.
///
/// Invariants re-established after every mutation:
/// - one `TimelineDay` per date key, days sorted by date key descending
/// - activities within a day sorted by start time descending (id breaks ties)
/// - activity ids unique across the whole window
/// - at most `max_days` days
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineWindow {
    days: Vec<TimelineDay>,
    top_offset: usize,
    bottom_offset: usize,
    has_more_top: bool,
    has_more_bottom: bool,
    max_days: usize,
    utc_offset: FixedOffset,
}

/// Result of folding one page into the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub fetched: usize,
    pub added: usize,
    pub evicted_days: usize,
}

impl TimelineWindow {
    pub fn new(max_days: usize, utc_offset: FixedOffset) -> Self {
        Self {
            days: Vec::new(),
            top_offset: 0,
            bottom_offset: 0,
            has_more_top: false,
            has_more_bottom: false,
            max_days: max_days.max(1),
            utc_offset,
        }
    }

    pub fn days(&self) -> &[TimelineDay] {
        &self.days
    }

    pub fn top_offset(&self) -> usize {
        self.top_offset
    }

    pub fn bottom_offset(&self) -> usize {
        self.bottom_offset
    }

    pub fn has_more_top(&self) -> bool {
        self.has_more_top
    }

    pub fn has_more_bottom(&self) -> bool {
        self.has_more_bottom
    }

    pub fn max_days(&self) -> usize {
        self.max_days
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn activity_count(&self) -> usize {
        self.days.iter().map(|d| d.activities.len()).sum()
    }

    pub fn day_key(&self, activity: &Activity) -> String {
        day_key(&activity.start_time, &self.utc_offset)
    }

    pub fn has_more(&self, direction: LoadDirection) -> bool {
        match direction {
            LoadDirection::Top => self.has_more_top,
            LoadDirection::Bottom => self.has_more_bottom,
        }
    }

    pub fn offset(&self, direction: LoadDirection) -> usize {
        match direction {
            LoadDirection::Top => self.top_offset,
            LoadDirection::Bottom => self.bottom_offset,
        }
    }

    pub fn find(&self, activity_id: &str) -> Option<&Activity> {
        self.days
            .iter()
            .flat_map(|d| d.activities.iter())
            .find(|a| a.id == activity_id)
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.find(activity_id).is_some()
    }

    fn locate(&self, activity_id: &str) -> Option<(usize, usize)> {
        self.days.iter().enumerate().find_map(|(di, day)| {
            day.activities
                .iter()
                .position(|a| a.id == activity_id)
                .map(|ai| (di, ai))
        })
    }

    /// Replace the window with the first page of history.
    pub fn initialize(&mut self, activities: Vec<Activity>, page_size: usize) -> MergeReport {
        let fetched = activities.len();
        self.days.clear();
        let added = self.merge(activities, LoadDirection::Bottom);
        let evicted_days = self.truncate_tail();

        self.top_offset = 0;
        self.bottom_offset = fetched;
        // the first page is by definition the newest edge
        self.has_more_top = false;
        self.has_more_bottom = fetched == page_size;

        MergeReport {
            fetched,
            added,
            evicted_days,
        }
    }

    /// Fold a page fetched at one edge into the window.
    ///
    /// Loading at the top evicts the oldest days when over capacity; loading
    /// at the bottom evicts the newest. Only the loaded edge's cursor and
    /// has-more flag move; evicted days return only through `initialize`.
    pub fn merge_page(
        &mut self,
        direction: LoadDirection,
        activities: Vec<Activity>,
        page_size: usize,
    ) -> MergeReport {
        let fetched = activities.len();
        let added = self.merge(activities, direction);
        let has_more = fetched == page_size;

        let evicted_days = match direction {
            LoadDirection::Top => {
                self.top_offset += fetched;
                self.has_more_top = has_more;
                self.truncate_tail()
            }
            LoadDirection::Bottom => {
                self.bottom_offset += fetched;
                self.has_more_bottom = has_more;
                self.truncate_head()
            }
        };

        MergeReport {
            fetched,
            added,
            evicted_days,
        }
    }

    fn merge(&mut self, activities: Vec<Activity>, direction: LoadDirection) -> usize {
        let mut known: HashSet<String> = self
            .days
            .iter()
            .flat_map(|d| d.activities.iter().map(|a| a.id.clone()))
            .collect();

        let mut added = 0;
        for activity in activities {
            if !known.insert(activity.id.clone()) {
                continue;
            }
            let key = self.day_key(&activity);
            match self.days.iter_mut().find(|d| d.date == key) {
                Some(day) => match direction {
                    LoadDirection::Top => day.activities.insert(0, activity),
                    LoadDirection::Bottom => day.activities.push(activity),
                },
                None => self.days.push(TimelineDay {
                    date: key,
                    activities: vec![activity],
                }),
            }
            added += 1;
        }

        for day in &mut self.days {
            sort_activities(&mut day.activities);
        }
        sort_days(&mut self.days);
        added
    }

    /// Drop the oldest days beyond capacity.
    fn truncate_tail(&mut self) -> usize {
        let excess = self.days.len().saturating_sub(self.max_days);
        self.days.truncate(self.max_days);
        excess
    }

    /// Drop the newest days beyond capacity.
    fn truncate_head(&mut self) -> usize {
        let excess = self.days.len().saturating_sub(self.max_days);
        self.days.drain(..excess);
        excess
    }

    /// Apply a partial update to an activity, relocating it when its start
    /// time crosses a day boundary. Unknown ids and updates that change
    /// nothing leave the window untouched.
    pub fn apply_partial_update(
        &mut self,
        activity_id: &str,
        patch: &ActivityPatch,
    ) -> PartialUpdateOutcome {
        let Some((day_idx, act_idx)) = self.locate(activity_id) else {
            return PartialUpdateOutcome::default();
        };

        let current = &self.days[day_idx].activities[act_idx];
        let mut next = current.clone();
        if let Some(title) = &patch.title {
            next.title = title.clone();
        }
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        if let Some(name) = &patch.name {
            next.name = Some(name.clone());
        }
        if let Some(start) = patch.start_time {
            next.start_time = start;
        }
        if let Some(end) = patch.end_time {
            next.end_time = end;
        }
        if let Some(version) = patch.version {
            next.version = version;
        }
        next.end_time = next.end_time.max(next.start_time);

        // day membership follows from start_time, so equality covers it
        if next == *current {
            return PartialUpdateOutcome::default();
        }

        let old_key = self.days[day_idx].date.clone();
        let new_key = self.day_key(&next);
        let moved = old_key != new_key;

        if moved {
            let old_day = &mut self.days[day_idx];
            old_day.activities.remove(act_idx);
            if old_day.activities.is_empty() {
                self.days.remove(day_idx);
            }
            match self.days.iter_mut().find(|d| d.date == new_key) {
                Some(day) => {
                    day.activities.push(next);
                    sort_activities(&mut day.activities);
                }
                None => self.days.push(TimelineDay {
                    date: new_key,
                    activities: vec![next],
                }),
            }
        } else {
            let day = &mut self.days[day_idx];
            day.activities[act_idx] = next;
            sort_activities(&mut day.activities);
        }

        sort_days(&mut self.days);
        self.truncate_tail();

        PartialUpdateOutcome {
            updated: true,
            moved,
        }
    }

    /// Remove an activity, dropping its day if it becomes empty.
    pub fn remove_activity(&mut self, activity_id: &str) -> Option<Activity> {
        let (day_idx, act_idx) = self.locate(activity_id)?;
        let day = &mut self.days[day_idx];
        let removed = day.activities.remove(act_idx);
        if day.activities.is_empty() {
            self.days.remove(day_idx);
        }
        Some(removed)
    }

    pub fn set_event_summaries(&mut self, activity_id: &str, summaries: Vec<EventSummary>) -> bool {
        let Some((day_idx, act_idx)) = self.locate(activity_id) else {
            return false;
        };
        self.days[day_idx].activities[act_idx].event_summaries = summaries;
        true
    }
}

fn sort_activities(activities: &mut [Activity]) {
    activities.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.id.cmp(&a.id))
    });
}

fn sort_days(days: &mut [TimelineDay]) {
    days.sort_by(|a, b| b.date.cmp(&a.date));
}
