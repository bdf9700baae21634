//! # CacheKit Net
//!
//! HTTP request/response model and the fetch backend seam for the CacheKit
//! offline-cache runtime.
//!
//! ## Design Goals
//!
//! 1. **One request model**: the worker's fetch policy sees the same shape
//!    whether a response came from the network or a store
//! 2. **Origin classification**: responses are tagged same-origin or
//!    cross-origin so the policy can refuse to cache foreign content
//! 3. **Swappable backend**: [`FetchBackend`] is the only seam to the real
//!    network, so tests can script it

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

/// Errors that can occur while fetching.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::Failed(error.to_string())
    }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,

    /// Request URL.
    pub url: Url,

    /// Request headers.
    pub headers: HeaderMap,

    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with no headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Whether this request's method writes server state.
    ///
    /// Mutating requests are never looked up in a store and never cached.
    pub fn is_mutation(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "DELETE" | "PATCH")
    }
}

/// Origin classification of a response, relative to the application's own
/// origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Same-origin ("basic") response.
    Basic,
    /// Response whose final URL is a different origin: a direct foreign
    /// request, or a cross-origin redirect.
    CrossOrigin,
}

/// A fetched response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Final URL (after redirects).
    pub url: Url,
}

impl Response {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

/// Classify a response's final URL against the application origin.
///
/// Opaque origins (`data:`, `file:`) never match anything, including
/// themselves, so they always classify as cross-origin.
pub fn classify(origin: &Url, response_url: &Url) -> ResponseClass {
    let origin = origin.origin();
    if origin.is_tuple() && origin == response_url.origin() {
        ResponseClass::Basic
    } else {
        ResponseClass::CrossOrigin
    }
}

/// The seam to the real network.
///
/// Exactly one implementation talks HTTP ([`HttpFetcher`]); tests substitute
/// scripted doubles.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    /// Issue the request and return the response, however it resolves.
    ///
    /// No retry and no timeout are imposed at this layer; a request either
    /// resolves, fails, or stays pending.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// [`FetchBackend`] backed by a real HTTP client.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchBackend for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        debug!(method = %request.method, url = %request.url, "network fetch");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(status = %status, body_len = body.len(), "response received");

        Ok(Response {
            status,
            headers,
            body,
            url,
        })
    }
}
