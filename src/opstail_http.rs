//! [`LogSource`] backed by the HTTP search endpoints.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::opstail_core::{Filters, StreamKind};
use crate::opstail_protocol::{
    ErrorBody, FetchError, FetchFuture, LogSource, Page, PageRequest, SearchBody, SearchResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum HttpSourceError {
    #[error("invalid base url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpLogSource {
    client: reqwest::Client,
    base_url: String,
    env: Option<String>,
    auth_token: Option<String>,
}

impl HttpLogSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HttpSourceError> {
        let raw = base_url.into();
        let base_url = raw.trim().trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|error| HttpSourceError::InvalidUrl { url: raw.clone(), message: error.to_string() })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HttpSourceError::InvalidUrl { url: raw, message: "expected http or https".to_string() });
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("opstail/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url, env: None, auth_token: None })
    }

    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env.filter(|env| !env.trim().is_empty());
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn endpoint(&self, kind: &StreamKind) -> String {
        format!("{}/logs/{}", self.base_url, kind.endpoint())
    }

    async fn search(&self, filters: &Filters, request: PageRequest) -> Result<Page, FetchError> {
        let body = SearchBody::new(filters, &request);
        let url = self.endpoint(&filters.kind);
        let request_id = Uuid::new_v4().to_string();
        let mut builder = self.client.post(&url).header(REQUEST_ID_HEADER, &request_id).json(&body);
        if let Some(env) = &self.env {
            builder = builder.query(&[("env", env)]);
        }
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|error| FetchError::Transport(error.to_string()))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|error| FetchError::Transport(error.to_string()))?;
        debug!(%url, %request_id, status = status.as_u16(), bytes = bytes.len(), "search response");

        if !status.is_success() {
            let error_body = serde_json::from_slice::<ErrorBody>(&bytes).ok();
            return Err(FetchError::from_response(status.as_u16(), error_body));
        }
        let response: SearchResponse =
            serde_json::from_slice(&bytes).map_err(|error| FetchError::Decode(error.to_string()))?;
        Ok(response.into_page())
    }
}

impl LogSource for HttpLogSource {
    fn fetch<'a>(&'a self, filters: &'a Filters, request: PageRequest) -> FetchFuture<'a> {
        Box::pin(self.search(filters, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://127.0.0.1:7400", StreamKind::Operations, "http://127.0.0.1:7400/logs/operations")]
    #[case(
        " https://logs.example.com/api/ ",
        StreamKind::Messages { operation_id: "op-1".to_string() },
        "https://logs.example.com/api/logs/messages"
    )]
    fn endpoint_joins_base_url(#[case] base: &str, #[case] kind: StreamKind, #[case] expected: &str) {
        let source = HttpLogSource::new(base).expect("source");
        assert_eq!(source.endpoint(&kind), expected);
    }

    #[rstest]
    #[case("not a url")]
    #[case("ftp://example.com")]
    fn rejects_unusable_base_urls(#[case] base: &str) {
        assert!(matches!(HttpLogSource::new(base), Err(HttpSourceError::InvalidUrl { .. })));
    }

    #[test]
    fn blank_env_and_token_are_ignored() {
        let source = HttpLogSource::new("http://localhost:1")
            .expect("source")
            .with_env(Some("  ".to_string()))
            .with_auth_token(Some(String::new()));
        assert!(source.env.is_none());
        assert!(source.auth_token.is_none());
    }

    #[tokio::test]
    async fn connection_failure_is_a_transport_error() {
        let source = HttpLogSource::new("http://127.0.0.1:1").expect("source");
        let error = source
            .fetch(&Filters::operations(), PageRequest::head(10))
            .await
            .expect_err("nothing listens on port 1");
        assert_eq!(error.kind(), "transport");
    }
}
