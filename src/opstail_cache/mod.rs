//! Page store for one filter scope.
//!
//! Pages are kept in fetch order with `pages[0]` as the head page. Every
//! mutation re-derives the flattened view: de-duplicated by id, newest first,
//! and never longer than the latest reported total.

mod merge;

use std::collections::HashSet;

use tracing::debug;

use crate::opstail_core::{Cursor, FilterKey, LogEntry};
use crate::opstail_protocol::Page;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Ids visible now that were not visible before the merge.
    pub added: usize,
    /// Oldest entries dropped to stay within the reported total.
    pub dropped: usize,
    pub len: usize,
    pub reordered: bool,
}

#[derive(Debug, Clone)]
pub struct PageCache {
    key: FilterKey,
    pages: Vec<Page>,
    flattened: Vec<LogEntry>,
    total: u64,
    forward_cursor: Option<Cursor>,
    backward_cursor: Option<Cursor>,
    /// Bumped on every mutation.
    revision: u64,
}

impl PageCache {
    pub fn new(key: FilterKey) -> Self {
        Self {
            key,
            pages: Vec::new(),
            flattened: Vec::new(),
            total: 0,
            forward_cursor: None,
            backward_cursor: None,
            revision: 0,
        }
    }

    pub fn key(&self) -> &FilterKey {
        &self.key
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn flattened(&self) -> &[LogEntry] {
        &self.flattened
    }

    pub fn len(&self) -> usize {
        self.flattened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flattened.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn forward_cursor(&self) -> Option<&Cursor> {
        self.forward_cursor.as_ref()
    }

    pub fn backward_cursor(&self) -> Option<&Cursor> {
        self.backward_cursor.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_more(&self) -> bool {
        (self.flattened.len() as u64) < self.total && self.forward_cursor.is_some()
    }

    /// Adds an older page behind the existing ones.
    pub fn append(&mut self, page: Page) -> MergeOutcome {
        if self.pages.is_empty() {
            return self.replace_head(page);
        }
        let previous = std::mem::take(&mut self.flattened);
        self.total = page.total;
        self.forward_cursor = page.forward_cursor.clone();
        self.pages.push(page);
        self.rebuild(&previous)
    }

    /// Merges a cursorless head fetch as the new `pages[0]`.
    pub fn replace_head(&mut self, page: Page) -> MergeOutcome {
        let adopt_forward = self.pages.len() <= 1;
        self.merge_head(page, adopt_forward)
    }

    /// Merges entries fetched with the backward cursor. The forward cursor
    /// of such a page points into already cached data, so it is ignored.
    pub fn merge_newer(&mut self, page: Page) -> MergeOutcome {
        self.merge_head(page, false)
    }

    /// Keeps only the head page and forgets how to page further back.
    pub fn trim(&mut self) -> usize {
        let dropped = self.pages.len().saturating_sub(1);
        self.pages.truncate(1);
        self.forward_cursor = None;
        let previous = std::mem::take(&mut self.flattened);
        let outcome = self.rebuild(&previous);
        debug!(dropped_pages = dropped, len = outcome.len, "trimmed page cache");
        dropped
    }

    pub fn reset_pagination(&mut self) {
        self.forward_cursor = None;
        self.backward_cursor = None;
        self.revision += 1;
    }

    pub fn clear_backward_cursor(&mut self) {
        self.backward_cursor = None;
        self.revision += 1;
    }

    /// The fetched page becomes `pages[0]` as returned; old head entries it
    /// no longer covers move into their own page right behind it, so the
    /// head never grows past one fetched page.
    fn merge_head(&mut self, page: Page, adopt_forward: bool) -> MergeOutcome {
        let previous = std::mem::take(&mut self.flattened);
        self.total = page.total;
        if adopt_forward {
            self.forward_cursor = page.forward_cursor.clone();
        }
        if !page.entries.is_empty() && page.backward_cursor.is_some() {
            self.backward_cursor = page.backward_cursor.clone();
        }

        if self.pages.is_empty() {
            self.pages.push(page);
        } else if !page.entries.is_empty() {
            let spilled = merge::spill_head(&page.entries, &self.pages[0].entries);
            self.pages[0] = page;
            if !spilled.is_empty() {
                let total = self.total;
                self.pages.insert(
                    1,
                    Page {
                        forward_cursor: spilled.last().map(Cursor::for_entry),
                        backward_cursor: spilled.first().map(Cursor::for_entry),
                        entries: spilled,
                        total,
                    },
                );
            }
        }
        self.rebuild(&previous)
    }

    fn rebuild(&mut self, previous: &[LogEntry]) -> MergeOutcome {
        let mut flattened = merge::dedup_concat(self.pages.iter().map(|page| page.entries.as_slice()));
        let reordered = merge::restore_order(&mut flattened);
        if reordered {
            debug!(len = flattened.len(), "restored newest-first order after merge");
        }
        let dropped = self.enforce_total(&mut flattened);
        let added = merge::count_unseen(previous, &flattened);
        self.flattened = flattened;
        self.revision += 1;
        MergeOutcome { added, dropped, len: self.flattened.len(), reordered }
    }

    /// Drops the oldest surplus when a sliding window shrank the total.
    fn enforce_total(&mut self, flattened: &mut Vec<LogEntry>) -> usize {
        let bound = usize::try_from(self.total).unwrap_or(usize::MAX);
        if flattened.len() <= bound {
            return 0;
        }
        let surplus = flattened.split_off(bound);
        let surplus_ids: HashSet<&str> = surplus.iter().map(|entry| entry.id.as_str()).collect();
        for page in &mut self.pages {
            page.entries.retain(|entry| !surplus_ids.contains(entry.id.as_str()));
        }
        if self.pages.len() > 1 {
            let mut index = 0;
            self.pages.retain(|page| {
                index += 1;
                index == 1 || !page.entries.is_empty()
            });
        }
        debug!(dropped = surplus.len(), total = self.total, "dropped entries beyond reported total");
        surplus.len()
    }
}
