use std::collections::HashSet;

use crate::opstail_core::{compare_newest_first, LogEntry};

/// Concatenates page entries keeping the first occurrence of every id.
pub(crate) fn dedup_concat<'a>(pages: impl IntoIterator<Item = &'a [LogEntry]>) -> Vec<LogEntry> {
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut merged = Vec::new();
    for page in pages {
        for entry in page {
            if seen.insert(entry.id.as_str()) {
                merged.push(entry.clone());
            }
        }
    }
    merged
}

/// Entries of the previous head whose id is not in `incoming`, in order.
pub(crate) fn spill_head(incoming: &[LogEntry], previous: &[LogEntry]) -> Vec<LogEntry> {
    let incoming_ids: HashSet<&str> = incoming.iter().map(|entry| entry.id.as_str()).collect();
    previous.iter().filter(|entry| !incoming_ids.contains(entry.id.as_str())).cloned().collect()
}

pub(crate) fn is_newest_first(entries: &[LogEntry]) -> bool {
    entries.windows(2).all(|pair| compare_newest_first(&pair[0], &pair[1]).is_le())
}

/// Returns `true` when a sort was needed.
pub(crate) fn restore_order(entries: &mut [LogEntry]) -> bool {
    if is_newest_first(entries) {
        return false;
    }
    entries.sort_by(compare_newest_first);
    true
}

pub(crate) fn count_unseen(previous: &[LogEntry], current: &[LogEntry]) -> usize {
    let seen: HashSet<&str> = previous.iter().map(|entry| entry.id.as_str()).collect();
    current.iter().filter(|entry| !seen.contains(entry.id.as_str())).count()
}
