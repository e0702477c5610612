//! # Repost Net
//!
//! Request/response model and network access for the Repost offline worker.
//!
//! ## Design Goals
//!
//! 1. **Fetch-shaped types**: requests carry the mode, destination and cache
//!    mode a browser attaches to them, because routing decisions depend on them
//! 2. **Fully buffered responses**: bodies are `Bytes`, so a response can be
//!    cloned into a cache and returned to the caller without re-reading
//! 3. **Swappable network**: everything above this crate talks to the
//!    [`Fetcher`] trait, never to reqwest directly

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network unreachable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// What the response is going to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// `fetch()`/XHR calls.
    #[default]
    Empty,
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
    Other,
}

impl RequestDestination {
    /// Guess the destination of a subresource from its path extension.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".webmanifest") || path.ends_with("manifest.json") {
            return Self::Manifest;
        }

        let Some(guess) = mime_guess::from_path(path).first() else {
            return Self::Empty;
        };

        let (top, sub) = (guess.type_(), guess.subtype());
        if top == mime::IMAGE {
            Self::Image
        } else if top == mime::FONT {
            Self::Font
        } else if sub == mime::CSS {
            Self::Style
        } else if sub == mime::JAVASCRIPT {
            Self::Script
        } else if sub == mime::HTML {
            Self::Document
        } else {
            Self::Other
        }
    }
}

/// HTTP cache mode for the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Bypass intermediate HTTP caches and revalidate with the origin.
    Reload,
    NoStore,
}

/// An intercepted or outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: RequestDestination,
    pub cache: CacheMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: RequestDestination::default(),
            cache: CacheMode::default(),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .destination(RequestDestination::Document)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Content-Type` header.
    pub fn content_type(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => self.header(header::CONTENT_TYPE, v),
            Err(_) => self,
        }
    }

    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    pub fn cache_mode(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Parsed `Content-Type` of the request body, if any.
    pub fn mime_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Whether this request targets the given origin.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL (after redirects); the request URL for synthesized responses.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create an empty response.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a JSON response from a serializable value.
    pub fn json_body<T: serde::Serialize>(
        url: Url,
        status: StatusCode,
        value: &T,
    ) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self::new(url, status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed `Content-Type`.
    pub fn content_type(&self) -> Option<Mime> {
        self.header("content-type").and_then(|s| s.parse().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// A resolved `Ok` means the server answered, whatever the status; `Err` means
/// no answer arrived (unreachable host, connection reset, stack timeout).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// A network that is always down.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        tracing::debug!(url = %request.url, "Network disabled, failing request");
        Err(NetError::Offline)
    }
}
