//! Cursor-paginated fetch contract between the page cache and a log backend.
//!
//! [`LogSource`] is the seam; [`SearchBody`] / [`SearchResponse`] are the JSON
//! wire shapes used by the HTTP endpoints.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::opstail_core::{Cursor, Filters, LogEntry, Period, StreamKind, TimeWindow, ALL};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// Error code the backend uses for a malformed or expired cursor.
pub const INVALID_CURSOR_CODE: &str = "invalid_cursor";

/// Where a page starts. Exactly one position per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageAnchor {
    Head,
    Older(Cursor),
    Newer(Cursor),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageRequest {
    pub anchor: PageAnchor,
    pub limit: usize,
    pub period: Option<Period>,
}

impl PageRequest {
    pub fn head(limit: usize) -> Self {
        Self { anchor: PageAnchor::Head, limit, period: None }
    }

    pub fn older(cursor: Cursor, limit: usize) -> Self {
        Self { anchor: PageAnchor::Older(cursor), limit, period: None }
    }

    pub fn newer(cursor: Cursor, limit: usize) -> Self {
        Self { anchor: PageAnchor::Newer(cursor), limit, period: None }
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }
}

/// One fetched page. `total` counts every entry matching the filters, not
/// just this page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub entries: Vec<LogEntry>,
    pub forward_cursor: Option<Cursor>,
    pub backward_cursor: Option<Cursor>,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stale cursor: {0}")]
    StaleCursor(String),
    #[error("request rejected with status {status} ({code}): {message}")]
    Rejected { status: u16, code: String, message: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Maps a non-200 response onto the error taxonomy.
    pub fn from_response(status: u16, body: Option<ErrorBody>) -> Self {
        let (code, message) = match body {
            Some(body) => (body.error.code, body.error.message),
            None => ("unknown".to_string(), format!("status {status}")),
        };
        if status == 400 && code == INVALID_CURSOR_CODE {
            Self::StaleCursor(message)
        } else if status >= 500 {
            Self::Transport(format!("{status} {code}: {message}"))
        } else {
            Self::Rejected { status, code, message }
        }
    }

    pub fn is_stale_cursor(&self) -> bool {
        matches!(self, Self::StaleCursor(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::StaleCursor(_) => "stale_cursor",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
        }
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Page, FetchError>> + Send + 'a>>;

/// Anything that can serve cursor-paginated pages for a filter scope.
pub trait LogSource: Send + Sync + 'static {
    fn fetch<'a>(&'a self, filters: &'a Filters, request: PageRequest) -> FetchFuture<'a>;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syncs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<Cursor>,
}

impl SearchBody {
    /// Operations page older data with `cursor`, messages with `cursorAfter`;
    /// both use `cursorBefore` for newer data.
    pub fn new(filters: &Filters, request: &PageRequest) -> Self {
        let mut body = Self {
            states: wire_set(&filters.states),
            types: wire_set(&filters.types),
            integrations: wire_set(&filters.integrations),
            connections: wire_set(&filters.connections),
            syncs: wire_set(&filters.syncs),
            operation_id: filters.kind.operation_id().map(str::to_string),
            search: filters.search_query().map(str::to_string),
            period: request.period,
            limit: Some(request.limit),
            ..Self::default()
        };
        match (&request.anchor, &filters.kind) {
            (PageAnchor::Head, _) => {}
            (PageAnchor::Older(cursor), StreamKind::Operations) => body.cursor = Some(cursor.clone()),
            (PageAnchor::Older(cursor), StreamKind::Messages { .. }) => {
                body.cursor_after = Some(cursor.clone())
            }
            (PageAnchor::Newer(cursor), _) => body.cursor_before = Some(cursor.clone()),
        }
        body
    }

    /// `None` when more than one cursor is set.
    pub fn anchor(&self) -> Option<PageAnchor> {
        match (&self.cursor, &self.cursor_after, &self.cursor_before) {
            (None, None, None) => Some(PageAnchor::Head),
            (Some(cursor), None, None) | (None, Some(cursor), None) => {
                Some(PageAnchor::Older(cursor.clone()))
            }
            (None, None, Some(cursor)) => Some(PageAnchor::Newer(cursor.clone())),
            _ => None,
        }
    }

    pub fn page_request(&self) -> Option<PageRequest> {
        Some(PageRequest {
            anchor: self.anchor()?,
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            period: self.period,
        })
    }

    pub fn to_filters(&self, kind: StreamKind) -> Filters {
        let window = match self.period {
            Some(period) => TimeWindow::Absolute { from: period.from, to: period.to },
            None => TimeWindow::default(),
        };
        Filters {
            kind,
            states: self.states.clone(),
            types: self.types.clone(),
            integrations: self.integrations.clone(),
            connections: self.connections.clone(),
            syncs: self.syncs.clone(),
            window,
            search: self.search.clone(),
        }
    }
}

fn wire_set(values: &[String]) -> Vec<String> {
    let mut set: Vec<String> = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if set.iter().any(|value| value == ALL) {
        set.clear();
    }
    set
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<Cursor>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub data: Vec<LogEntry>,
    pub pagination: Pagination,
}

impl SearchResponse {
    pub fn from_page(page: Page, kind: &StreamKind) -> Self {
        let mut pagination = Pagination {
            total: page.total,
            cursor_before: page.backward_cursor,
            ..Pagination::default()
        };
        match kind {
            StreamKind::Operations => pagination.cursor = page.forward_cursor,
            StreamKind::Messages { .. } => pagination.cursor_after = page.forward_cursor,
        }
        Self { data: page.entries, pagination }
    }

    pub fn into_page(self) -> Page {
        let Pagination { total, cursor, cursor_before, cursor_after } = self.pagination;
        Page {
            entries: self.data,
            forward_cursor: cursor_after.or(cursor),
            backward_cursor: cursor_before,
            total,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error: ErrorDetail { code: code.into(), message: message.into() } }
    }
}
