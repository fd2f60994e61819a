//! Authenticated HTTP client for the Airship API.
//!
//! The API answers authenticated POSTs with `307 Temporary Redirect` and a
//! `Set-Cookie` token that must be echoed back as `Cookie` on the next
//! request, with the original body re-sent. Stock redirect handling drops one
//! or the other, so [`Client::post`] owns the redirect loop and the HTTP
//! client it drives must have redirects disabled (see [`http_builder`]).

use std::env;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, InvalidHeaderValue, ACCEPT, ACCEPT_ENCODING, AUTHORIZATION,
    CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE,
};
use reqwest::redirect::Policy;
use reqwest::{ClientBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Production base URL of the Airship API.
pub const DEFAULT_BASE_URL: &str = "https://api.urbanairship.com/api";
/// `Accept` header sent on every request.
pub const ACCEPT_VALUE: &str =
    "application/vnd.urbanairship+x-json,application/vnd.urbanairship+x-ndjson;version=3;";
/// Number of `307` hops followed before giving up.
pub const MAX_REDIRECTS: usize = 10;
/// Environment variable holding `<app key>:<master secret>`.
pub const CREDENTIALS_ENV: &str = "UA_CREDS";
/// Environment variable overriding the events endpoint URL.
pub const EVENTS_URL_ENV: &str = "UA_EVENTS_URL";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns a `reqwest` builder configured the way [`Client`] needs it:
/// automatic redirects disabled and transparent gzip decoding enabled.
///
/// Use this when injecting a custom HTTP client with
/// [`Client::with_http_client`].
pub fn http_builder() -> ClientBuilder {
    reqwest::Client::builder().redirect(Policy::none()).gzip(true)
}

/// App key and master secret used for HTTP Basic auth.
#[derive(Clone, Debug)]
pub struct Credentials {
    key: String,
    secret: SecretString,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: SecretString) -> Self {
        Self {
            key: key.into(),
            secret,
        }
    }

    /// Parses `<app key>:<master secret>`.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let (key, secret) = raw
            .trim()
            .split_once(':')
            .ok_or(ClientError::InvalidCredentials)?;
        Ok(Self::new(key, SecretString::new(secret.to_string())))
    }

    /// Reads credentials from [`CREDENTIALS_ENV`].
    pub fn from_env() -> Result<Self, ClientError> {
        let raw = env::var(CREDENTIALS_ENV).map_err(|_| ClientError::MissingCredentials)?;
        if raw.trim().is_empty() {
            return Err(ClientError::MissingCredentials);
        }
        Self::parse(&raw)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn authorization(&self) -> Result<HeaderValue, ClientError> {
        let encoded =
            BASE64_STANDARD.encode(format!("{}:{}", self.key, self.secret.expose_secret()));
        let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Base URL every request path is appended to.
    pub base_url: String,
    /// Full URL of the events endpoint. When unset, events are fetched from
    /// `{base_url}/events/`.
    pub events_url: Option<String>,
    /// Connect timeout of the default HTTP client. Ignored once a client is
    /// injected with [`Client::with_http_client`].
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            events_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Airship API client. Credentials and URLs are fixed once built.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    events_url: Option<String>,
    authorization: HeaderValue,
}

impl Client {
    /// Creates a client for the production API.
    pub fn new(key: impl Into<String>, secret: SecretString) -> Result<Self, ClientError> {
        Self::with_options(Credentials::new(key, secret), ClientOptions::default())
    }

    pub fn with_options(
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let http = http_builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ClientError::Transport)?;

        Ok(Self {
            http,
            base_url: trim_url(options.base_url),
            events_url: options.events_url.map(|url| url.trim().to_string()),
            authorization: credentials.authorization()?,
        })
    }

    /// Builds a client from [`CREDENTIALS_ENV`] and the optional
    /// [`EVENTS_URL_ENV`] override.
    pub fn from_env() -> Result<Self, ClientError> {
        let credentials = Credentials::from_env()?;
        let events_url = env::var(EVENTS_URL_ENV)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Self::with_options(
            credentials,
            ClientOptions {
                events_url,
                ..ClientOptions::default()
            },
        )
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_url(base_url.into());
        self
    }

    /// Sets an explicit events endpoint, taking precedence over `base_url`.
    pub fn with_events_url(mut self, events_url: impl Into<String>) -> Self {
        self.events_url = Some(events_url.into().trim().to_string());
        self
    }

    /// Replaces the HTTP client. It must not follow redirects itself and
    /// should decode gzip; [`http_builder`] returns a suitable builder.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn events_url(&self) -> Option<&str> {
        self.events_url.as_deref()
    }

    /// POSTs `body` as JSON to `{base_url}/{path}/`, following `307`
    /// redirects and their cookies. A `None` or `null` body sends no body.
    pub async fn post<B>(&self, path: &str, body: Option<&B>) -> Result<Response, ClientError>
    where
        B: Serialize + ?Sized,
    {
        self.post_with_headers(path, body, &HeaderMap::new()).await
    }

    /// Like [`Client::post`] with additional request headers. Auth, accept
    /// and cookie headers set by the client take precedence.
    pub async fn post_with_headers<B>(
        &self,
        path: &str,
        body: Option<&B>,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>
    where
        B: Serialize + ?Sized,
    {
        self.post_to(self.endpoint(path), body, headers).await
    }

    /// POSTs to a full URL. The body is encoded once and re-sent verbatim on
    /// every redirect hop.
    pub(crate) async fn post_to<B>(
        &self,
        mut url: String,
        body: Option<&B>,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let body = encode_body(body)?;
        let mut response = self.send(&url, body.as_ref(), None, headers).await?;

        let mut redirects = 0;
        while response.status() == StatusCode::TEMPORARY_REDIRECT {
            if redirects == MAX_REDIRECTS {
                warn!(event = "redirect_limit_exceeded", redirects, url = %url);
                drain(response).await;
                return Err(ClientError::TooManyRedirects);
            }
            redirects += 1;

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_owned);
            let cookie = response.headers().get(SET_COOKIE).cloned();
            drain(response).await;

            // No Location: retry the previous URL.
            if let Some(location) = location.as_deref() {
                url = self.resolve_location(location);
            }
            debug!(
                event = "redirect_followed",
                redirect = redirects,
                url = %url,
                cookie = cookie.is_some()
            );

            response = self.send(&url, body.as_ref(), cookie, headers).await?;
        }

        Ok(response)
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/", self.base_url, path)
    }

    fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http") {
            return location.to_string();
        }
        if location.starts_with('/') {
            format!("{}{}", self.base_url, location)
        } else {
            format!("{}/{}", self.base_url, location)
        }
    }

    async fn send(
        &self,
        url: &str,
        body: Option<&Bytes>,
        cookie: Option<HeaderValue>,
        extra: &HeaderMap,
    ) -> Result<Response, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        if let Some(cookie) = cookie {
            headers.insert(COOKIE, cookie);
        }

        let mut builder = self.http.post(url).headers(extra.clone()).headers(headers);
        if let Some(body) = body {
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body.clone());
        }

        builder.send().await.map_err(ClientError::Transport)
    }
}

fn encode_body<B>(body: Option<&B>) -> Result<Option<Bytes>, ClientError>
where
    B: Serialize + ?Sized,
{
    let Some(body) = body else {
        return Ok(None);
    };
    let encoded = serde_json::to_vec(body).map_err(ClientError::Encode)?;
    if encoded.is_empty() || encoded == b"null" {
        return Ok(None);
    }
    Ok(Some(Bytes::from(encoded)))
}

/// Reads a response body to completion so the connection can be pooled.
async fn drain(mut response: Response) {
    while let Ok(Some(_)) = response.chunk().await {}
}

fn trim_url(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("too many redirects")]
    TooManyRedirects,

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("missing credentials; set {} to <app key>:<master secret>", CREDENTIALS_ENV)]
    MissingCredentials,

    #[error("invalid credentials; expected <app key>:<master secret>")]
    InvalidCredentials,
}
