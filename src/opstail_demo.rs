//! Synthetic operations and messages for `--demo`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};

use crate::opstail_backend::{BackendError, MemoryBackend};
use crate::opstail_core::{timestamp_from_millis, LogEntry, LogLevel, OperationState, Timestamp};

const INTEGRATIONS: &[&str] = &["hubspot", "github", "salesforce", "slack", "notion", "zendesk"];
const SYNCS: &[&str] = &["contacts", "issues", "deals", "channels", "pages", "tickets"];
const TYPES: &[&str] = &["sync", "sync", "sync", "action", "webhook", "auth"];
const PATHS: &[&str] = &["/v3/objects", "/repos/issues", "/crm/deals", "/conversations.list", "/search"];

struct DemoRng {
    state: u64,
}

impl DemoRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // splitmix64
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn gen_range_u32(&mut self, range: std::ops::Range<u32>) -> u32 {
        let width = range.end.saturating_sub(range.start);
        if width == 0 {
            return range.start;
        }
        range.start + (self.next_u64() % u64::from(width)) as u32
    }

    fn chance(&mut self, numerator: u32, denominator: u32) -> bool {
        if denominator == 0 {
            return false;
        }
        self.gen_range_u32(0..denominator) < numerator.min(denominator)
    }

    fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let idx = self.gen_range_u32(0..items.len().max(1) as u32) as usize % items.len();
        &items[idx]
    }
}

pub struct DemoGenerator {
    rng: DemoRng,
    seq: u64,
}

impl DemoGenerator {
    pub fn new(seed: u64) -> Self {
        Self { rng: DemoRng::new(seed), seq: 0 }
    }

    /// One operation created at `at`, followed by its messages.
    pub fn operation(&mut self, at: Timestamp) -> Vec<LogEntry> {
        self.seq += 1;
        let millis = at.timestamp_millis();
        let operation_id = format!("op-{millis:x}-{:04}", self.seq);
        let integration = *self.rng.choose(INTEGRATIONS);
        let sync = *self.rng.choose(SYNCS);
        let kind = *self.rng.choose(TYPES);
        let state = self.state();
        let duration_ms = u64::from(self.rng.gen_range_u32(40..9_000));

        let mut operation = LogEntry::new(
            operation_id.clone(),
            at,
            kind,
            format!("{kind} {sync} for {integration}"),
        )
        .with_state(state)
        .with_integration(integration)
        .with_connection(format!("conn-{}", self.rng.gen_range_u32(1..9)))
        .with_sync(sync);
        operation.duration_ms = Some(duration_ms);

        let mut entries = vec![operation];
        let message_count = self.rng.gen_range_u32(1..5);
        for index in 0..message_count {
            let Some(created_at) = timestamp_from_millis(millis + i64::from(index) * 7 + 1) else {
                continue;
            };
            let (level, message, meta) = self.message(state, index + 1 == message_count);
            let mut entry = LogEntry::new(format!("{operation_id}-m{index}"), created_at, "log", message)
                .with_level(level)
                .with_operation(operation_id.clone());
            entry.meta = meta;
            entries.push(entry);
        }
        entries
    }

    /// `count` operations spread over the `span` before `now`, newest last.
    pub fn history(&mut self, now: Timestamp, count: usize, span: Duration) -> Vec<LogEntry> {
        let span_ms = span.as_millis().min(i64::MAX as u128) as i64;
        let step = span_ms / (count.max(1) as i64);
        let start = now.timestamp_millis() - span_ms;
        let jitter_range = step.clamp(1, i64::from(u32::MAX)) as u32;
        let mut entries = Vec::new();
        for index in 0..count as i64 {
            let jitter = i64::from(self.rng.gen_range_u32(0..jitter_range));
            if let Some(at) = timestamp_from_millis(start + index * step + jitter / 2) {
                entries.extend(self.operation(at));
            }
        }
        entries
    }

    fn state(&mut self) -> OperationState {
        match self.rng.gen_range_u32(0..100) {
            0..=61 => OperationState::Success,
            62..=77 => OperationState::Failed,
            78..=87 => OperationState::Running,
            88..=93 => OperationState::Waiting,
            94..=97 => OperationState::Timeout,
            _ => OperationState::Cancelled,
        }
    }

    fn message(&mut self, state: OperationState, last: bool) -> (LogLevel, String, serde_json::Value) {
        let path = *self.rng.choose(PATHS);
        if last && matches!(state, OperationState::Failed | OperationState::Timeout) {
            let status = if state == OperationState::Timeout { 504 } else { *self.rng.choose(&[401, 429, 500]) };
            return (
                LogLevel::Error,
                format!("POST {path} failed with {status}"),
                json!({ "request": { "method": "POST", "url": path }, "response": { "code": status } }),
            );
        }
        if self.rng.chance(1, 6) {
            return (LogLevel::Warn, format!("rate limited on {path}, retrying"), serde_json::Value::Null);
        }
        let records = self.rng.gen_range_u32(0..500);
        let level = if self.rng.chance(1, 4) { LogLevel::Debug } else { LogLevel::Info };
        (
            level,
            format!("GET {path} 200 ({records} records)"),
            json!({ "request": { "method": "GET", "url": path }, "response": { "code": 200 } }),
        )
    }
}

pub fn seed_backend(backend: &MemoryBackend, generator: &mut DemoGenerator, count: usize) -> Result<(), BackendError> {
    let now = truncate_to_millis(Utc::now());
    for entry in generator.history(now, count, Duration::from_secs(3_600)) {
        backend.insert(entry)?;
    }
    debug!(entries = backend.len(), "seeded demo history");
    Ok(())
}

/// Appends a fresh operation every fraction of a second until shutdown.
pub async fn run_demo(backend: Arc<MemoryBackend>, mut generator: DemoGenerator, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let delay_ms = 400 + u64::from(generator.rng.gen_range_u32(0..1_200));
        tokio::select! {
            res = shutdown.recv() => {
                match res {
                    Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            _ = time::sleep(Duration::from_millis(delay_ms)) => {
                let now = truncate_to_millis(Utc::now());
                for entry in generator.operation(now) {
                    if let Err(error) = backend.insert(entry) {
                        warn!(%error, "demo insert failed");
                    }
                }
            }
        }
    }
}

fn truncate_to_millis(at: Timestamp) -> Timestamp {
    timestamp_from_millis(at.timestamp_millis()).unwrap_or(at)
}

pub fn demo_seed() -> u64 {
    (Utc::now().timestamp_millis() as u64) ^ (std::process::id() as u64).wrapping_mul(0x9E3779B97F4A7C15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opstail_core::{compare_newest_first, Filters};
    use crate::opstail_protocol::PageRequest;
    use std::collections::HashSet;

    fn now() -> Timestamp {
        timestamp_from_millis(1_700_000_000_000).expect("timestamp")
    }

    #[test]
    fn same_seed_generates_same_history() {
        let first = DemoGenerator::new(7).history(now(), 20, Duration::from_secs(600));
        let second = DemoGenerator::new(7).history(now(), 20, Duration::from_secs(600));
        assert_eq!(first, second);
    }

    #[test]
    fn operations_carry_their_messages() {
        let entries = DemoGenerator::new(3).operation(now());
        let operation = &entries[0];

        assert!(operation.state.is_some());
        assert!(entries.len() >= 2);
        for message in &entries[1..] {
            assert_eq!(message.operation_id.as_deref(), Some(operation.id.as_str()));
            assert!(message.level.is_some());
            assert!(message.created_at > operation.created_at);
        }
    }

    #[test]
    fn history_ids_are_unique_and_inside_span() {
        let entries = DemoGenerator::new(11).history(now(), 100, Duration::from_secs(3_600));
        let ids: HashSet<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids.len(), entries.len());

        let earliest = now() - chrono::Duration::hours(1);
        assert!(entries.iter().all(|entry| entry.created_at >= earliest));
        assert!(entries.iter().all(|entry| entry.created_at <= now() + chrono::Duration::seconds(1)));
    }

    #[test]
    fn seeded_backend_serves_operations_newest_first() {
        let backend = MemoryBackend::new();
        seed_backend(&backend, &mut DemoGenerator::new(5), 40).expect("seed");

        let filters = Filters { types: vec!["sync".to_string(), "action".to_string(), "webhook".to_string(), "auth".to_string()], ..Filters::operations() };
        let page = backend.search(&filters, &PageRequest::head(50)).expect("search");
        assert_eq!(page.total, 40);
        assert!(page.entries.windows(2).all(|pair| compare_newest_first(&pair[0], &pair[1]).is_lt()));
    }
}
