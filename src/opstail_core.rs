//! Domain model shared by the cache, the stream controller and the backends.

pub mod types {
    use std::cmp::Ordering;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    pub type Timestamp = DateTime<Utc>;

    pub fn timestamp_from_millis(millis: i64) -> Option<Timestamp> {
        DateTime::from_timestamp_millis(millis)
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum OperationState {
        Waiting,
        Running,
        Success,
        Failed,
        Timeout,
        Cancelled,
    }

    impl OperationState {
        pub const ALL: [Self; 6] = [
            Self::Waiting,
            Self::Running,
            Self::Success,
            Self::Failed,
            Self::Timeout,
            Self::Cancelled,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                Self::Waiting => "waiting",
                Self::Running => "running",
                Self::Success => "success",
                Self::Failed => "failed",
                Self::Timeout => "timeout",
                Self::Cancelled => "cancelled",
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Debug,
        Info,
        Warn,
        Error,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Debug => "debug",
                Self::Info => "info",
                Self::Warn => "warn",
                Self::Error => "error",
            }
        }
    }

    /// One recorded event: an operation, or a message logged under an operation.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LogEntry {
        pub id: String,
        pub created_at: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub state: Option<OperationState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub level: Option<LogLevel>,
        pub r#type: String,
        #[serde(default)]
        pub message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub integration: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub connection: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub sync: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub operation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        pub meta: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub duration_ms: Option<u64>,
    }

    impl LogEntry {
        pub fn new(
            id: impl Into<String>,
            created_at: Timestamp,
            r#type: impl Into<String>,
            message: impl Into<String>,
        ) -> Self {
            Self {
                id: id.into(),
                created_at,
                state: None,
                level: None,
                r#type: r#type.into(),
                message: message.into(),
                integration: None,
                connection: None,
                sync: None,
                operation_id: None,
                meta: Value::Null,
                duration_ms: None,
            }
        }

        pub fn with_state(mut self, state: OperationState) -> Self {
            self.state = Some(state);
            self
        }

        pub fn with_level(mut self, level: LogLevel) -> Self {
            self.level = Some(level);
            self
        }

        pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
            self.integration = Some(integration.into());
            self
        }

        pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
            self.connection = Some(connection.into());
            self
        }

        pub fn with_sync(mut self, sync: impl Into<String>) -> Self {
            self.sync = Some(sync.into());
            self
        }

        pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
            self.operation_id = Some(operation_id.into());
            self
        }

        pub fn created_at_millis(&self) -> i64 {
            self.created_at.timestamp_millis()
        }

        /// Short status label: the operation state, else the message level.
        pub fn status_label(&self) -> &'static str {
            match (self.state, self.level) {
                (Some(state), _) => state.as_str(),
                (None, Some(level)) => level.as_str(),
                (None, None) => "-",
            }
        }
    }

    /// Newest first at millisecond precision, the resolution cursors carry;
    /// equal milliseconds fall back to the id, descending.
    pub fn compare_newest_first(left: &LogEntry, right: &LogEntry) -> Ordering {
        right
            .created_at_millis()
            .cmp(&left.created_at_millis())
            .then_with(|| right.id.cmp(&left.id))
    }

    /// Which log endpoint a stream reads from.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum StreamKind {
        #[default]
        Operations,
        Messages {
            operation_id: String,
        },
    }

    impl StreamKind {
        pub fn endpoint(&self) -> &'static str {
            match self {
                Self::Operations => "operations",
                Self::Messages { .. } => "messages",
            }
        }

        pub fn operation_id(&self) -> Option<&str> {
            match self {
                Self::Operations => None,
                Self::Messages { operation_id } => Some(operation_id.as_str()),
            }
        }
    }
}

pub mod filters {
    use chrono::Duration;
    use regex::{Regex, RegexBuilder};
    use serde::{Deserialize, Serialize};
    use smol_str::SmolStr;
    use thiserror::Error;

    use crate::opstail_core::types::{LogEntry, StreamKind, Timestamp};

    /// Multi-select value meaning "no constraint".
    pub const ALL: &str = "all";

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum PeriodPreset {
        #[serde(rename = "last5m")]
        Last5m,
        #[serde(rename = "last1h")]
        Last1h,
        #[serde(rename = "last24h")]
        Last24h,
        #[serde(rename = "last3d")]
        Last3d,
        #[serde(rename = "last7d")]
        Last7d,
        #[serde(rename = "last14d")]
        Last14d,
    }

    impl PeriodPreset {
        pub const ALL: [Self; 6] =
            [Self::Last5m, Self::Last1h, Self::Last24h, Self::Last3d, Self::Last7d, Self::Last14d];

        pub fn name(self) -> &'static str {
            match self {
                Self::Last5m => "last5m",
                Self::Last1h => "last1h",
                Self::Last24h => "last24h",
                Self::Last3d => "last3d",
                Self::Last7d => "last7d",
                Self::Last14d => "last14d",
            }
        }

        pub fn parse(value: &str) -> Option<Self> {
            let value = value.trim();
            Self::ALL.into_iter().find(|preset| preset.name().eq_ignore_ascii_case(value))
        }

        pub fn width(self) -> Duration {
            match self {
                Self::Last5m => Duration::minutes(5),
                Self::Last1h => Duration::hours(1),
                Self::Last24h => Duration::hours(24),
                Self::Last3d => Duration::days(3),
                Self::Last7d => Duration::days(7),
                Self::Last14d => Duration::days(14),
            }
        }
    }

    /// A resolved `[from, to]` query range, inclusive on both ends.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Period {
        pub from: Timestamp,
        pub to: Timestamp,
    }

    impl Period {
        pub fn width(&self) -> Duration {
            self.to - self.from
        }

        /// Same width, ending at `now`.
        pub fn slide_to(&self, now: Timestamp) -> Self {
            Self { from: now - self.width(), to: now }
        }

        pub fn contains(&self, at: Timestamp) -> bool {
            self.from <= at && at <= self.to
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum TimeWindow {
        Relative { preset: PeriodPreset },
        Absolute { from: Timestamp, to: Timestamp },
    }

    impl Default for TimeWindow {
        fn default() -> Self {
            Self::Relative { preset: PeriodPreset::Last24h }
        }
    }

    impl TimeWindow {
        pub fn relative(preset: PeriodPreset) -> Self {
            Self::Relative { preset }
        }

        pub fn is_absolute(&self) -> bool {
            matches!(self, Self::Absolute { .. })
        }

        /// Relative windows end at `anchor`; absolute ranges ignore it.
        pub fn resolve(&self, anchor: Timestamp) -> Period {
            match *self {
                Self::Relative { preset } => Period { from: anchor - preset.width(), to: anchor },
                Self::Absolute { from, to } => Period { from, to },
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct Filters {
        #[serde(default)]
        pub kind: StreamKind,
        #[serde(default)]
        pub states: Vec<String>,
        #[serde(default)]
        pub types: Vec<String>,
        #[serde(default)]
        pub integrations: Vec<String>,
        #[serde(default)]
        pub connections: Vec<String>,
        #[serde(default)]
        pub syncs: Vec<String>,
        #[serde(default)]
        pub window: TimeWindow,
        #[serde(default)]
        pub search: Option<String>,
    }

    impl Filters {
        pub fn operations() -> Self {
            Self::default()
        }

        pub fn messages(operation_id: impl Into<String>) -> Self {
            Self {
                kind: StreamKind::Messages { operation_id: operation_id.into() },
                ..Self::default()
            }
        }

        pub fn with_search(mut self, search: impl Into<String>) -> Self {
            self.search = Some(search.into());
            self
        }

        pub fn with_window(mut self, window: TimeWindow) -> Self {
            self.window = window;
            self
        }

        pub fn search_query(&self) -> Option<&str> {
            self.search.as_deref().map(str::trim).filter(|query| !query.is_empty())
        }

        pub fn has_search(&self) -> bool {
            self.search_query().is_some()
        }

        pub fn key(&self) -> FilterKey {
            FilterKey {
                kind: self.kind.clone(),
                states: normalize_set(&self.states),
                types: normalize_set(&self.types),
                integrations: normalize_set(&self.integrations),
                connections: normalize_set(&self.connections),
                syncs: normalize_set(&self.syncs),
                window: self.window,
                search: self.search_query().map(SmolStr::new),
            }
        }

        pub fn compile_search(&self) -> Result<Option<QueryMatcher>, FilterError> {
            let Some(query) = self.search_query() else {
                return Ok(None);
            };
            if let Some(pattern) = strip_regex_delimiters(query) {
                return Ok(Some(QueryMatcher::Regex(compile_regex(pattern)?)));
            }
            Ok(Some(QueryMatcher::Substring(query.to_lowercase())))
        }

        /// Scope and set filters plus the compiled search; the time window is
        /// applied separately against a resolved [`Period`].
        pub fn matches(&self, entry: &LogEntry, query: Option<&QueryMatcher>) -> bool {
            if let StreamKind::Messages { operation_id } = &self.kind {
                if entry.operation_id.as_deref() != Some(operation_id.as_str()) {
                    return false;
                }
            }

            let state = entry.state.map(|state| state.as_str());
            set_allows(&self.states, state)
                && set_allows(&self.types, Some(&entry.r#type))
                && set_allows(&self.integrations, entry.integration.as_deref())
                && set_allows(&self.connections, entry.connection.as_deref())
                && set_allows(&self.syncs, entry.sync.as_deref())
                && query.map_or(true, |query| query.matches(entry))
        }
    }

    /// Normalized filter tuple; two filter values that select the same
    /// entries produce equal keys.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct FilterKey {
        kind: StreamKind,
        states: Vec<SmolStr>,
        types: Vec<SmolStr>,
        integrations: Vec<SmolStr>,
        connections: Vec<SmolStr>,
        syncs: Vec<SmolStr>,
        window: TimeWindow,
        search: Option<SmolStr>,
    }

    impl FilterKey {
        pub fn kind(&self) -> &StreamKind {
            &self.kind
        }
    }

    fn normalize_set(values: &[String]) -> Vec<SmolStr> {
        let mut set: Vec<SmolStr> = values
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(SmolStr::new)
            .collect();
        if set.iter().any(|value| value == ALL) {
            return Vec::new();
        }
        set.sort();
        set.dedup();
        set
    }

    fn set_allows(values: &[String], candidate: Option<&str>) -> bool {
        let mut constrained = false;
        for value in values.iter().map(|value| value.trim()).filter(|value| !value.is_empty()) {
            if value == ALL {
                return true;
            }
            constrained = true;
            if candidate == Some(value) {
                return true;
            }
        }
        !constrained
    }

    #[derive(Clone, Debug)]
    pub enum QueryMatcher {
        Substring(String),
        Regex(Regex),
    }

    impl QueryMatcher {
        pub fn matches(&self, entry: &LogEntry) -> bool {
            match self {
                Self::Substring(query) => {
                    entry.message.to_lowercase().contains(query)
                        || entry.r#type.to_lowercase().contains(query)
                }
                Self::Regex(regex) => regex.is_match(&entry.message) || regex.is_match(&entry.r#type),
            }
        }
    }

    fn strip_regex_delimiters(query: &str) -> Option<&str> {
        query.strip_prefix('/').and_then(|q| q.strip_suffix('/')).filter(|q| !q.is_empty())
    }

    fn compile_regex(pattern: &str) -> Result<Regex, FilterError> {
        RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|error| {
            FilterError::InvalidRegex { pattern: pattern.to_string(), message: error.to_string() }
        })
    }

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum FilterError {
        #[error("invalid regex {pattern:?}: {message}")]
        InvalidRegex { pattern: String, message: String },
    }
}

pub mod cursor {
    use std::cmp::Ordering;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use chrono::Duration;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    use crate::opstail_core::types::{LogEntry, Timestamp};

    /// Opaque pagination token: base64 of the JSON array `[createdAtMillis, "id"]`.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Cursor(String);

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct CursorPosition {
        pub created_at_millis: i64,
        pub id: String,
    }

    impl Cursor {
        pub fn from_token(token: impl Into<String>) -> Self {
            Self(token.into())
        }

        pub fn encode(created_at_millis: i64, id: &str) -> Self {
            let payload = serde_json::json!([created_at_millis, id]).to_string();
            Self(STANDARD.encode(payload))
        }

        pub fn for_entry(entry: &LogEntry) -> Self {
            Self::encode(entry.created_at_millis(), &entry.id)
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn decode(&self) -> Result<CursorPosition, CursorError> {
            let bytes = STANDARD.decode(self.0.trim())?;
            let (created_at_millis, id): (i64, String) = serde_json::from_slice(&bytes)?;
            Ok(CursorPosition { created_at_millis, id })
        }

        /// A cursor that cannot be decoded is never fresh.
        pub fn is_fresh(&self, now: Timestamp, max_age: Duration) -> bool {
            match self.decode() {
                Ok(position) => now.timestamp_millis() - position.created_at_millis <= max_age.num_milliseconds(),
                Err(_) => false,
            }
        }
    }

    impl CursorPosition {
        /// Where `entry` sits relative to this position in newest-first order.
        pub fn order_of(&self, entry: &LogEntry) -> Ordering {
            self.created_at_millis
                .cmp(&entry.created_at_millis())
                .then_with(|| self.id.as_str().cmp(entry.id.as_str()))
        }

        pub fn is_older(&self, entry: &LogEntry) -> bool {
            self.order_of(entry) == Ordering::Greater
        }

        pub fn is_newer(&self, entry: &LogEntry) -> bool {
            self.order_of(entry) == Ordering::Less
        }
    }

    #[derive(Debug, Error)]
    pub enum CursorError {
        #[error("cursor is not base64: {0}")]
        Encoding(#[from] base64::DecodeError),
        #[error("cursor payload is not [timestamp, id]: {0}")]
        Payload(#[from] serde_json::Error),
    }
}

pub use cursor::{Cursor, CursorError, CursorPosition};
pub use filters::{FilterError, FilterKey, Filters, Period, PeriodPreset, QueryMatcher, TimeWindow, ALL};
pub use types::{
    compare_newest_first, timestamp_from_millis, LogEntry, LogLevel, OperationState, StreamKind,
    Timestamp,
};

#[cfg(test)]
mod tests {
    use super::cursor::Cursor;
    use super::filters::{FilterError, Filters, PeriodPreset, TimeWindow};
    use super::types::{
        compare_newest_first, timestamp_from_millis, LogEntry, LogLevel, OperationState, Timestamp,
    };
    use chrono::Duration;
    use rstest::{fixture, rstest};
    use std::cmp::Ordering;

    const BASE_MILLIS: i64 = 1_700_000_000_000;

    fn at(offset_millis: i64) -> Timestamp {
        timestamp_from_millis(BASE_MILLIS + offset_millis).expect("valid timestamp")
    }

    #[fixture]
    fn operation() -> LogEntry {
        LogEntry::new("op-1", at(0), "sync", "Fetched 12 records from hubspot")
            .with_state(OperationState::Success)
            .with_integration("hubspot")
            .with_connection("conn-a")
            .with_sync("contacts")
    }

    #[test]
    fn newest_first_breaks_timestamp_ties_by_id() {
        let older = LogEntry::new("a", at(0), "sync", "");
        let newer = LogEntry::new("b", at(1), "sync", "");
        let twin = LogEntry::new("c", at(1), "sync", "");

        assert_eq!(compare_newest_first(&newer, &older), Ordering::Less);
        assert_eq!(compare_newest_first(&twin, &newer), Ordering::Less);
        assert_eq!(compare_newest_first(&older, &older), Ordering::Equal);
    }

    #[test]
    fn newest_first_agrees_with_cursor_order_within_a_millisecond() {
        let base = at(0);
        let early = LogEntry::new("z", base + Duration::microseconds(100), "sync", "");
        let late = LogEntry::new("a", base + Duration::microseconds(900), "sync", "");

        // Same millisecond, so the id decides: "z" sorts before "a".
        assert_eq!(compare_newest_first(&early, &late), Ordering::Less);
        let position = Cursor::for_entry(&late).decode().expect("decode");
        assert!(position.is_newer(&early));
    }

    #[test]
    fn entry_wire_shape_is_camel_case() {
        let entry = LogEntry::new("m-1", at(0), "http", "GET /contacts")
            .with_level(LogLevel::Warn)
            .with_operation("op-1");
        let value = serde_json::to_value(&entry).expect("serialize");

        assert_eq!(value["operationId"], "op-1");
        assert_eq!(value["level"], "warn");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("state").is_none());
        assert_eq!(entry.status_label(), "warn");
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec!["all"], vec![])]
    #[case(vec!["failed", "all"], vec![])]
    #[case(vec![" failed", "success", "failed"], vec!["success", "failed"])]
    fn equivalent_selections_share_a_key(#[case] left: Vec<&str>, #[case] right: Vec<&str>) {
        let left = Filters { states: left.into_iter().map(String::from).collect(), ..Filters::default() };
        let right = Filters { states: right.into_iter().map(String::from).collect(), ..Filters::default() };
        assert_eq!(left.key(), right.key());
    }

    #[test]
    fn key_tracks_scope_and_search() {
        let base = Filters::messages("op-1");
        assert_ne!(base.key(), Filters::messages("op-2").key());
        assert_ne!(base.key(), base.clone().with_search("timeout").key());
        assert_eq!(base.key(), base.clone().with_search("   ").key());
    }

    #[rstest]
    fn set_filters_match_operation_fields(operation: LogEntry) {
        let mut filters = Filters::operations();
        assert!(filters.matches(&operation, None));

        filters.states = vec!["failed".to_string()];
        assert!(!filters.matches(&operation, None));

        filters.states = vec!["failed".to_string(), "success".to_string()];
        filters.integrations = vec!["hubspot".to_string()];
        filters.syncs = vec!["all".to_string()];
        assert!(filters.matches(&operation, None));

        filters.connections = vec!["conn-b".to_string()];
        assert!(!filters.matches(&operation, None));
    }

    #[rstest]
    fn messages_scope_requires_parent_operation(operation: LogEntry) {
        let filters = Filters::messages("op-9");
        assert!(!filters.matches(&operation, None));
        assert!(filters.matches(&operation.with_operation("op-9"), None));
    }

    #[rstest]
    #[case("HUBSPOT", true)]
    #[case("/fetched \\d+ records/", true)]
    #[case("/^contacts$/", false)]
    #[case("salesforce", false)]
    fn search_matches_message_text(operation: LogEntry, #[case] query: &str, #[case] expected: bool) {
        let filters = Filters::operations().with_search(query);
        let matcher = filters.compile_search().expect("compile");
        assert_eq!(filters.matches(&operation, matcher.as_ref()), expected);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let result = Filters::operations().with_search("/([a-z/").compile_search();
        assert!(matches!(result, Err(FilterError::InvalidRegex { .. })));
    }

    #[rstest]
    #[case("last5m", Some(PeriodPreset::Last5m))]
    #[case(" LAST24H ", Some(PeriodPreset::Last24h))]
    #[case("last2w", None)]
    fn presets_parse_by_name(#[case] raw: &str, #[case] expected: Option<PeriodPreset>) {
        assert_eq!(PeriodPreset::parse(raw), expected);
    }

    #[test]
    fn relative_window_slides_keeping_width() {
        let window = TimeWindow::relative(PeriodPreset::Last1h);
        let first = window.resolve(at(0));
        let slid = first.slide_to(at(90_000));

        assert_eq!(first.width(), Duration::hours(1));
        assert_eq!(slid.width(), first.width());
        assert_eq!(slid, window.resolve(at(90_000)));
        assert!(slid.contains(at(90_000)));
        assert!(!slid.contains(at(-3_600_000)));
    }

    #[test]
    fn absolute_window_ignores_anchor() {
        let window = TimeWindow::Absolute { from: at(-10), to: at(10) };
        assert!(window.is_absolute());
        assert_eq!(window.resolve(at(5_000)), window.resolve(at(0)));
        assert!(!TimeWindow::default().is_absolute());
    }

    #[rstest]
    fn cursor_encodes_timestamp_and_id(operation: LogEntry) {
        let cursor = Cursor::for_entry(&operation);
        let raw = String::from_utf8(
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, cursor.as_str())
                .expect("base64"),
        )
        .expect("utf8");
        assert_eq!(raw, format!("[{BASE_MILLIS},\"op-1\"]"));

        let position = cursor.decode().expect("decode");
        assert_eq!(position.created_at_millis, BASE_MILLIS);
        assert_eq!(position.id, "op-1");
        assert_eq!(position.order_of(&operation), Ordering::Equal);
        assert!(position.is_older(&LogEntry::new("op-0", at(-1), "sync", "")));
        assert!(position.is_newer(&LogEntry::new("op-2", at(1), "sync", "")));
    }

    #[rstest]
    #[case("not base64!!")]
    #[case("eyJhIjoxfQ==")]
    fn malformed_cursor_fails_to_decode(#[case] token: &str) {
        let cursor = Cursor::from_token(token);
        assert!(cursor.decode().is_err());
        assert!(!cursor.is_fresh(at(0), Duration::seconds(30)));
    }

    #[rstest]
    #[case(10_000, true)]
    #[case(30_000, true)]
    #[case(30_001, false)]
    fn cursor_freshness_uses_max_age(#[case] elapsed_millis: i64, #[case] fresh: bool) {
        let cursor = Cursor::encode(BASE_MILLIS, "op-1");
        assert_eq!(cursor.is_fresh(at(elapsed_millis), Duration::seconds(30)), fresh);
    }
}
