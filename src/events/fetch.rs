//! Fetch entry points: validate a request, POST it, and wrap the stream.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::client::{Client, ClientError};
use crate::events::request::{Filter, Request, RequestError, Start, Subset};
use crate::events::response::Response;

/// Path of the events endpoint relative to the API base URL.
pub const EVENTS_PATH: &str = "events";

/// HTTP seam used by [`fetch`]. [`Client`] is the production implementation;
/// tests can serve fixtures instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs an already validated request to the events endpoint.
    async fn post_events(&self, request: &Request) -> Result<reqwest::Response, ClientError>;
}

#[async_trait]
impl Transport for Client {
    async fn post_events(&self, request: &Request) -> Result<reqwest::Response, ClientError> {
        let url = match self.events_url() {
            Some(url) => url.to_string(),
            None => self.endpoint(EVENTS_PATH),
        };
        self.post_to(url, Some(request), &HeaderMap::new()).await
    }
}

/// Fetches events starting at `start`.
///
/// `offset` must be set exactly when `start` is [`Start::Offset`]; the
/// stream then resumes right after it. An empty `filters` selects all
/// events. The request is validated before anything is sent.
pub async fn fetch<T>(
    client: &T,
    start: Start,
    offset: Option<u64>,
    subset: Option<Subset>,
    filters: impl IntoIterator<Item = Filter>,
) -> Result<Response, FetchError>
where
    T: Transport + ?Sized,
{
    let mut request = Request::new(start, offset)?.with_filters(filters);
    request.subset = subset;
    fetch_request(client, &request).await
}

/// Validates and sends a fully built request.
pub async fn fetch_request<T>(client: &T, request: &Request) -> Result<Response, FetchError>
where
    T: Transport + ?Sized,
{
    request.validate()?;
    debug!(
        event = "events_fetch",
        position = ?request.position(),
        filters = request.filters.len(),
        subset = request.subset.is_some()
    );

    let response = client.post_events(request).await?;
    Response::from_http(response)
}

/// Fetches from the earliest retained event.
pub async fn fetch_from_start<T>(
    client: &T,
    filters: impl IntoIterator<Item = Filter>,
) -> Result<Response, FetchError>
where
    T: Transport + ?Sized,
{
    fetch(client, Start::Earliest, None, None, filters).await
}

/// Fetches only events arriving from now on.
pub async fn fetch_from_latest<T>(
    client: &T,
    filters: impl IntoIterator<Item = Filter>,
) -> Result<Response, FetchError>
where
    T: Transport + ?Sized,
{
    fetch(client, Start::Latest, None, None, filters).await
}

/// Resumes immediately after `offset`.
pub async fn fetch_from_offset<T>(
    client: &T,
    offset: u64,
    filters: impl IntoIterator<Item = Filter>,
) -> Result<Response, FetchError>
where
    T: Transport + ?Sized,
{
    fetch(client, Start::Offset, Some(offset), None, filters).await
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// The API answered `402 Payment Required`: too many concurrent
    /// connections to the events endpoint.
    #[error("request was rate limited")]
    RateLimited,

    #[error("unexpected non-200 response: {}", .0.as_u16())]
    UnexpectedStatus(StatusCode),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}
