//! Routing policies.
//!
//! Each policy turns one request into one response using the caches and the
//! network. Within a policy the order is strictly network → cache write →
//! return; cache writes are best-effort and never fail the request.

use std::sync::Arc;

use http::{header, HeaderValue, StatusCode};
use repost_net::{Fetcher, Request, RequestDestination, Response};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::{SwError, SwResult};

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    /// The pre-seeded offline page.
    OfflinePage,
    /// Built by the worker (offline error, placeholder, redirect).
    Synthesized,
}

/// A response together with its provenance.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    pub fn synthesized(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Synthesized,
        }
    }
}

/// Everything a policy needs, cheap to clone into background tasks.
#[derive(Clone)]
pub struct PolicyContext {
    pub config: Arc<WorkerConfig>,
    pub caches: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl PolicyContext {
    /// Store a response, logging instead of failing.
    async fn write_through(&self, cache_name: &str, key: RequestKey, response: &Response) {
        let result = async {
            let cache = Cache::open(self.caches.clone(), cache_name).await?;
            cache.put(key.clone(), response).await
        }
        .await;

        match result {
            Ok(()) => debug!(cache = %cache_name, key = %key, "Cached response"),
            Err(e) => warn!(cache = %cache_name, key = %key, error = %e, "Cache write dropped"),
        }
    }

    async fn lookup(&self, cache_name: Option<&str>, key: &RequestKey) -> Option<Response> {
        let found = match cache_name {
            Some(name) => self.caches.get(name, key).await,
            None => self.caches.match_any(key).await,
        };

        match found.and_then(|entry| entry.map(|e| e.to_response()).transpose()) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }
}

/// JSON body of the synthesized offline API response.
pub const OFFLINE_API_ERROR: &str = "Network unavailable and no cached data";

fn offline_api_response(request: &Request) -> Response {
    let body = json!({ "error": OFFLINE_API_ERROR, "offline": true });
    Response::json_body(request.url.clone(), StatusCode::SERVICE_UNAVAILABLE, &body)
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not encode offline body");
            Response::new(request.url.clone(), StatusCode::SERVICE_UNAVAILABLE)
        })
}

fn offline_html_response(request: &Request) -> Response {
    Response::new(request.url.clone(), StatusCode::SERVICE_UNAVAILABLE)
        .with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .with_body("<!doctype html><title>Offline</title><h1>You are offline</h1>")
}

fn image_placeholder(request: &Request) -> Response {
    Response::new(request.url.clone(), StatusCode::NOT_FOUND)
}

/// API policy: network first, cached copy when offline, synthesized 503 last.
///
/// Only a 200 counts as success. Any other status, like a network failure,
/// falls back to the cache.
pub async fn network_first(ctx: &PolicyContext, request: &Request) -> FetchResponse {
    let key = RequestKey::get(&request.url);
    let api_cache = ctx.config.api_cache.name();

    match ctx.fetcher.fetch(request).await {
        Ok(response) if response.status == StatusCode::OK => {
            ctx.write_through(&api_cache, key, &response).await;
            return FetchResponse::network(response);
        }
        Ok(response) => {
            debug!(url = %request.url, status = %response.status, "API answered non-200, trying cache");
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "API unreachable, trying cache");
        }
    }

    if let Some(cached) = ctx.lookup(Some(api_cache.as_str()), &key).await {
        info!(url = %request.url, "Serving API response from cache");
        return FetchResponse {
            response: cached,
            source: ResponseSource::Cache,
        };
    }

    info!(url = %request.url, "No cached API response, answering offline");
    FetchResponse::synthesized(offline_api_response(request))
}

/// Navigation policy: live page, then cached page, then the offline page.
pub async fn navigate_with_fallback(ctx: &PolicyContext, request: &Request) -> FetchResponse {
    let err = match ctx.fetcher.fetch(request).await {
        Ok(response) => return FetchResponse::network(response),
        Err(e) => e,
    };
    debug!(url = %request.url, error = %err, "Navigation failed, trying cache");

    let key = RequestKey::get(&request.url);
    if let Some(cached) = ctx.lookup(None, &key).await {
        return FetchResponse {
            response: cached,
            source: ResponseSource::Cache,
        };
    }

    let shell_cache = ctx.config.shell_cache.name();
    match ctx.config.offline_page_url() {
        Ok(offline_url) => {
            let offline_key = RequestKey::get(&offline_url);
            if let Some(page) = ctx.lookup(Some(shell_cache.as_str()), &offline_key).await {
                info!(url = %request.url, "Serving offline page");
                return FetchResponse {
                    response: page,
                    source: ResponseSource::OfflinePage,
                };
            }
            warn!(cache = %shell_cache, "Offline page missing from shell cache");
        }
        Err(e) => warn!(error = %e, "Offline page URL does not resolve"),
    }

    FetchResponse::synthesized(offline_html_response(request))
}

/// Static policy: cache first, network on miss.
///
/// A network failure for an image yields an empty 404; for anything else the
/// error is returned to the caller.
pub async fn cache_first(ctx: &PolicyContext, request: &Request) -> SwResult<FetchResponse> {
    let key = RequestKey::get(&request.url);

    if let Some(cached) = ctx.lookup(None, &key).await {
        if ctx.config.refresh_static_in_background {
            spawn_refresh(ctx.clone(), request.clone());
        }
        return Ok(FetchResponse {
            response: cached,
            source: ResponseSource::Cache,
        });
    }

    match ctx.fetcher.fetch(request).await {
        Ok(response) => {
            if is_storable_static(ctx, request, &response) {
                ctx.write_through(&ctx.config.static_cache.name(), key, &response)
                    .await;
            }
            Ok(FetchResponse::network(response))
        }
        Err(e) if request.destination == RequestDestination::Image => {
            debug!(url = %request.url, error = %e, "Image unavailable, serving placeholder");
            Ok(FetchResponse::synthesized(image_placeholder(request)))
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "Static asset unavailable");
            Err(SwError::Network(e))
        }
    }
}

/// Only same-origin 200s are kept. A redirect that lands off-origin is not.
fn is_storable_static(ctx: &PolicyContext, request: &Request, response: &Response) -> bool {
    response.status == StatusCode::OK
        && request.is_same_origin(&ctx.config.origin)
        && response.url.origin() == ctx.config.origin.origin()
}

fn spawn_refresh(ctx: PolicyContext, request: Request) {
    tokio::spawn(async move {
        match ctx.fetcher.fetch(&request).await {
            Ok(response) if is_storable_static(&ctx, &request, &response) => {
                let key = RequestKey::get(&request.url);
                ctx.write_through(&ctx.config.static_cache.name(), key, &response)
                    .await;
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Refresh not cacheable");
            }
            Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
        }
    });
}
