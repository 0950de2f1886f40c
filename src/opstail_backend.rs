//! In-memory log store answering cursor-paginated searches, plus the axum
//! `/logs/operations` and `/logs/messages` endpoints in front of it.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{Query, Request as AxumRequest, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::opstail_core::{
    compare_newest_first, Cursor, CursorError, FilterError, Filters, LogEntry, Period, QueryMatcher,
    StreamKind,
};
use crate::opstail_protocol::{
    ErrorBody, FetchError, FetchFuture, LogSource, Page, PageAnchor, PageRequest, SearchBody,
    SearchResponse, INVALID_CURSOR_CODE, MAX_PAGE_LIMIT,
};

#[cfg(feature = "rayon")]
const PAR_FILTER_THRESHOLD: usize = 4096;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),
    #[error(transparent)]
    InvalidSearch(#[from] FilterError),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("log store lock poisoned")]
    Poisoned,
}

impl BackendError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidCursor(_) | Self::InvalidSearch(_) | Self::InvalidBody(_) => 400,
            Self::Poisoned => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCursor(_) => INVALID_CURSOR_CODE,
            Self::InvalidSearch(_) => "invalid_search",
            Self::InvalidBody(_) => "invalid_body",
            Self::Poisoned => "server_error",
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }

    /// The error an HTTP client would see for the same failure.
    pub fn into_fetch_error(self) -> FetchError {
        FetchError::from_response(self.status_code(), Some(self.to_error_body()))
    }
}

/// Entries kept newest first.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(mut entries: Vec<LogEntry>) -> Self {
        entries.sort_by(compare_newest_first);
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.id.clone()));
        Self { entries: RwLock::new(entries) }
    }

    /// Inserts `entry`, replacing any stored entry with the same id.
    pub fn insert(&self, entry: LogEntry) -> Result<(), BackendError> {
        let mut entries = self.entries.write().map_err(|_| BackendError::Poisoned)?;
        if let Some(existing) = entries.iter().position(|stored| stored.id == entry.id) {
            entries.remove(existing);
        }
        let at = entries.partition_point(|stored| compare_newest_first(stored, &entry) == Ordering::Less);
        entries.insert(at, entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search(&self, filters: &Filters, request: &PageRequest) -> Result<Page, BackendError> {
        let matcher = filters.compile_search()?;
        let position = match &request.anchor {
            PageAnchor::Head => None,
            PageAnchor::Older(cursor) | PageAnchor::Newer(cursor) => Some(cursor.decode()?),
        };

        let entries = self.entries.read().map_err(|_| BackendError::Poisoned)?;
        let matched = matching(&entries, filters, matcher.as_ref(), request.period);
        let limit = request.limit.clamp(1, MAX_PAGE_LIMIT);

        let (start, end) = match (&request.anchor, &position) {
            (PageAnchor::Newer(_), Some(position)) => {
                let end = matched.partition_point(|entry| position.is_newer(entry));
                (end.saturating_sub(limit), end)
            }
            (_, Some(position)) => {
                let start = matched.partition_point(|entry| !position.is_older(entry));
                (start, (start + limit).min(matched.len()))
            }
            (_, None) => (0, limit.min(matched.len())),
        };

        let page_entries: Vec<LogEntry> = matched[start..end].iter().map(|entry| (*entry).clone()).collect();
        let forward_cursor =
            if end < matched.len() { page_entries.last().map(Cursor::for_entry) } else { None };
        let backward_cursor = page_entries.first().map(Cursor::for_entry).or_else(|| match &request.anchor {
            PageAnchor::Newer(cursor) => Some(cursor.clone()),
            _ => None,
        });

        debug!(
            scope = filters.kind.endpoint(),
            anchor = ?request.anchor,
            returned = page_entries.len(),
            total = matched.len(),
            "served page"
        );
        Ok(Page { entries: page_entries, forward_cursor, backward_cursor, total: matched.len() as u64 })
    }
}

fn matching<'a>(
    entries: &'a [LogEntry],
    filters: &Filters,
    matcher: Option<&QueryMatcher>,
    period: Option<Period>,
) -> Vec<&'a LogEntry> {
    let keep = |entry: &&LogEntry| {
        period.map_or(true, |period| period.contains(entry.created_at)) && filters.matches(entry, matcher)
    };

    #[cfg(feature = "rayon")]
    {
        if entries.len() >= PAR_FILTER_THRESHOLD {
            return entries.par_iter().filter(keep).collect();
        }
    }

    entries.iter().filter(keep).collect()
}

impl LogSource for MemoryBackend {
    fn fetch<'a>(&'a self, filters: &'a Filters, request: PageRequest) -> FetchFuture<'a> {
        let result = self.search(filters, &request).map_err(BackendError::into_fetch_error);
        Box::pin(std::future::ready(result))
    }
}

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Operations,
    Messages,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    env: Option<String>,
}

/// Search endpoints over `backend`. With `auth_token` set, requests must
/// carry it as a bearer token or in `x-opstail-token`.
pub fn router(backend: Arc<MemoryBackend>, auth_token: Option<String>) -> Router {
    Router::new()
        .route("/logs/operations", post(search_operations))
        .route("/logs/messages", post(search_messages))
        .route_layer(middleware::from_fn_with_state(AuthState { token: auth_token }, auth_middleware))
        .with_state(backend)
}

async fn search_operations(
    State(backend): State<Arc<MemoryBackend>>,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Response {
    handle_search(&backend, Endpoint::Operations, params, &body)
}

async fn search_messages(
    State(backend): State<Arc<MemoryBackend>>,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Response {
    handle_search(&backend, Endpoint::Messages, params, &body)
}

fn handle_search(backend: &MemoryBackend, endpoint: Endpoint, params: SearchParams, body: &[u8]) -> Response {
    match search(backend, endpoint, body) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            debug!(?endpoint, env = ?params.env, code = error.code(), %error, "search rejected");
            let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(error.to_error_body())).into_response()
        }
    }
}

fn search(backend: &MemoryBackend, endpoint: Endpoint, body: &[u8]) -> Result<SearchResponse, BackendError> {
    let body: SearchBody =
        serde_json::from_slice(body).map_err(|error| BackendError::InvalidBody(error.to_string()))?;
    let kind = match endpoint {
        Endpoint::Operations => StreamKind::Operations,
        Endpoint::Messages => StreamKind::Messages {
            operation_id: body
                .operation_id
                .clone()
                .ok_or_else(|| BackendError::InvalidBody("operationId is required".to_string()))?,
        },
    };
    let request = body
        .page_request()
        .ok_or_else(|| BackendError::InvalidBody("at most one cursor may be set".to_string()))?;
    let filters = body.to_filters(kind.clone());
    let page = backend.search(&filters, &request)?;
    Ok(SearchResponse::from_page(page, &kind))
}

#[derive(Clone)]
struct AuthState {
    token: Option<String>,
}

async fn auth_middleware(State(auth): State<AuthState>, request: AxumRequest, next: Next) -> Response {
    let Some(expected) = auth.token.as_deref() else {
        return next.run(request).await;
    };

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let header = request
        .headers()
        .get("x-opstail-token")
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    if bearer.or(header) == Some(expected) {
        next.run(request).await
    } else {
        let body = ErrorBody::new("unauthorized", "missing or invalid token");
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opstail_core::{timestamp_from_millis, LogLevel, OperationState, Timestamp, TimeWindow};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rstest::{fixture, rstest};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const NOW_MILLIS: i64 = 1_700_000_000_000;

    fn at(offset_secs: i64) -> Timestamp {
        timestamp_from_millis(NOW_MILLIS + offset_secs * 1_000).expect("timestamp")
    }

    /// 30 operations, `op-29` newest; every third one failed. Each has two
    /// messages.
    fn seed() -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for index in 0..30i64 {
            let state = if index % 3 == 0 { OperationState::Failed } else { OperationState::Success };
            let operation_id = format!("op-{index:02}");
            entries.push(
                LogEntry::new(operation_id.clone(), at(index * 10 - 300), "sync", format!("sync run {index}"))
                    .with_state(state)
                    .with_integration(if index % 2 == 0 { "hubspot" } else { "github" }),
            );
            for message in 0..2 {
                entries.push(
                    LogEntry::new(
                        format!("{operation_id}-m{message}"),
                        at(index * 10 - 300 + message + 1),
                        "log",
                        if message == 0 { "GET /contacts 200" } else { "request timeout" },
                    )
                    .with_level(if message == 0 { LogLevel::Info } else { LogLevel::Error })
                    .with_operation(operation_id.clone()),
                );
            }
        }
        entries
    }

    fn operations_only() -> Filters {
        Filters { types: vec!["sync".to_string()], ..Filters::operations() }
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.entries.iter().map(|entry| entry.id.as_str()).collect()
    }

    #[fixture]
    fn backend() -> MemoryBackend {
        MemoryBackend::with_entries(seed())
    }

    #[rstest]
    fn head_page_is_newest_first_with_total(backend: MemoryBackend) {
        let page = backend.search(&operations_only(), &PageRequest::head(5)).expect("search");

        assert_eq!(ids(&page), vec!["op-29", "op-28", "op-27", "op-26", "op-25"]);
        assert_eq!(page.total, 30);
        assert_eq!(page.forward_cursor, Some(Cursor::for_entry(&page.entries[4])));
        assert_eq!(page.backward_cursor, Some(Cursor::for_entry(&page.entries[0])));
    }

    #[rstest]
    fn forward_cursor_chain_walks_every_entry_once(backend: MemoryBackend) {
        let filters = operations_only();
        let mut page = backend.search(&filters, &PageRequest::head(7)).expect("head");
        let mut seen: Vec<String> = page.entries.iter().map(|entry| entry.id.clone()).collect();
        while let Some(cursor) = page.forward_cursor.clone() {
            page = backend.search(&filters, &PageRequest::older(cursor, 7)).expect("older");
            seen.extend(page.entries.iter().map(|entry| entry.id.clone()));
        }

        let expected: Vec<String> = (0..30).rev().map(|index| format!("op-{index:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[rstest]
    fn newer_anchor_returns_closest_newer_entries(backend: MemoryBackend) {
        let filters = operations_only();
        let cursor = Cursor::for_entry(&LogEntry::new("op-20", at(-100), "sync", ""));
        let page = backend.search(&filters, &PageRequest::newer(cursor.clone(), 3)).expect("newer");

        assert_eq!(ids(&page), vec!["op-23", "op-22", "op-21"]);
        assert_eq!(page.total, 30);

        let newest = Cursor::for_entry(&LogEntry::new("op-29", at(-10), "sync", ""));
        let empty = backend.search(&filters, &PageRequest::newer(newest.clone(), 3)).expect("newer");
        assert!(empty.entries.is_empty());
        assert_eq!(empty.backward_cursor, Some(newest));
    }

    #[rstest]
    #[case(Filters { states: vec!["failed".to_string()], ..operations_only() }, 10)]
    #[case(Filters { integrations: vec!["github".to_string()], ..operations_only() }, 15)]
    #[case(Filters::messages("op-04"), 2)]
    #[case(Filters::messages("op-04").with_search("TIMEOUT"), 1)]
    #[case(Filters::operations().with_search("/^GET /"), 30)]
    fn filters_narrow_total(backend: MemoryBackend, #[case] filters: Filters, #[case] total: u64) {
        let page = backend.search(&filters, &PageRequest::head(50)).expect("search");
        assert_eq!(page.total, total);
    }

    #[rstest]
    fn period_bounds_results(backend: MemoryBackend) {
        let window = TimeWindow::Absolute { from: at(-100), to: at(-51) };
        let filters = operations_only().with_window(window);
        let request = PageRequest::head(50).with_period(window.resolve(at(0)));
        let page = backend.search(&filters, &request).expect("search");

        assert_eq!(ids(&page), vec!["op-24", "op-23", "op-22", "op-21", "op-20"]);
        assert!(page.forward_cursor.is_none());
    }

    #[rstest]
    fn malformed_cursor_is_a_stale_cursor(backend: MemoryBackend) {
        let request = PageRequest::older(Cursor::from_token("%%%"), 10);
        let error = backend.search(&operations_only(), &request).expect_err("invalid cursor");

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.code(), INVALID_CURSOR_CODE);
        assert!(error.into_fetch_error().is_stale_cursor());
    }

    #[rstest]
    fn invalid_regex_is_rejected(backend: MemoryBackend) {
        let error = backend
            .search(&Filters::operations().with_search("/(unclosed/"), &PageRequest::head(10))
            .expect_err("invalid regex");
        assert!(matches!(
            error.into_fetch_error(),
            FetchError::Rejected { status: 400, ref code, .. } if code == "invalid_search"
        ));
    }

    #[test]
    fn same_millisecond_entries_page_without_gaps() {
        let base = at(0);
        let backend = MemoryBackend::new();
        for (id, micros) in [("a", 900), ("b", 500), ("c", 100)] {
            backend
                .insert(LogEntry::new(id, base + chrono::Duration::microseconds(micros), "sync", ""))
                .expect("insert");
        }

        let filters = Filters::operations();
        let mut page = backend.search(&filters, &PageRequest::head(1)).expect("head");
        let mut seen = ids(&page).into_iter().map(str::to_string).collect::<Vec<_>>();
        while let Some(cursor) = page.forward_cursor.clone() {
            page = backend.search(&filters, &PageRequest::older(cursor, 1)).expect("older");
            seen.extend(ids(&page).into_iter().map(str::to_string));
        }
        assert_eq!(seen, vec!["c", "b", "a"]);
    }

    #[test]
    fn insert_keeps_order_and_replaces_by_id() {
        let backend = MemoryBackend::new();
        backend.insert(LogEntry::new("b", at(2), "sync", "")).expect("insert");
        backend.insert(LogEntry::new("a", at(1), "sync", "")).expect("insert");
        backend.insert(LogEntry::new("c", at(3), "sync", "")).expect("insert");
        backend
            .insert(LogEntry::new("a", at(1), "sync", "").with_state(OperationState::Failed))
            .expect("insert");

        let page = backend.search(&Filters::operations(), &PageRequest::head(10)).expect("search");
        assert_eq!(ids(&page), vec!["c", "b", "a"]);
        assert_eq!(page.entries[2].state, Some(OperationState::Failed));
        assert_eq!(backend.len(), 3);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn parallel_filtering_preserves_order() {
        let entries: Vec<LogEntry> = (0..(PAR_FILTER_THRESHOLD as i64 + 500))
            .map(|index| {
                LogEntry::new(format!("op-{index:06}"), at(index), "sync", "")
                    .with_state(if index % 2 == 0 { OperationState::Failed } else { OperationState::Success })
            })
            .collect();
        let backend = MemoryBackend::with_entries(entries);
        let filters = Filters { states: vec!["failed".to_string()], ..Filters::operations() };
        let page = backend.search(&filters, &PageRequest::head(MAX_PAGE_LIMIT)).expect("search");

        assert_eq!(page.total, (PAR_FILTER_THRESHOLD as u64 + 500) / 2);
        assert!(page.entries.windows(2).all(|pair| compare_newest_first(&pair[0], &pair[1]).is_lt()));
    }

    async fn post(router: Router, uri: &str, body: Value, token: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method("POST").uri(uri).header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let request = request.body(Body::from(body.to_string())).expect("request");
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json") };
        (status, value)
    }

    #[tokio::test]
    async fn operations_endpoint_serves_pages() {
        let app = router(Arc::new(MemoryBackend::with_entries(seed())), None);
        let (status, body) = post(app, "/logs/operations?env=dev", json!({ "types": ["sync"], "limit": 2 }), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "op-29");
        assert_eq!(body["pagination"]["total"], 30);
        assert!(body["pagination"]["cursor"].is_string());
        assert!(body["pagination"]["cursorAfter"].is_null());
    }

    #[tokio::test]
    async fn messages_endpoint_pages_with_cursor_after() {
        let app = router(Arc::new(MemoryBackend::with_entries(seed())), None);
        let (status, body) =
            post(app, "/logs/messages", json!({ "operationId": "op-07", "limit": 1 }), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "op-07-m1");
        assert!(body["pagination"]["cursorAfter"].is_string());
        assert!(body["pagination"]["cursorBefore"].is_string());
    }

    #[rstest]
    #[case("/logs/messages", json!({}), "invalid_body")]
    #[case("/logs/operations", json!({ "cursor": "@@" }), "invalid_cursor")]
    #[case("/logs/operations", json!({ "cursor": "a", "cursorBefore": "b" }), "invalid_body")]
    #[case("/logs/operations", json!({ "search": "/[/" }), "invalid_search")]
    #[tokio::test]
    async fn bad_requests_return_error_body(#[case] uri: &str, #[case] body: Value, #[case] code: &str) {
        let app = router(Arc::new(MemoryBackend::with_entries(seed())), None);
        let (status, body) = post(app, uri, body, None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], code);
    }

    #[tokio::test]
    async fn token_is_required_when_configured() {
        let backend = Arc::new(MemoryBackend::with_entries(seed()));
        let app = router(Arc::clone(&backend), Some("s3cret".to_string()));

        let (status, _) = post(app.clone(), "/logs/operations", json!({}), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = post(app.clone(), "/logs/operations", json!({}), Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = post(app, "/logs/operations", json!({}), Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
