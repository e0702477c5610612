//! Cache store abstraction.
//!
//! A [`CacheStorage`] holds named caches; each cache maps a [`RequestKey`] to a
//! captured [`CacheEntry`]. Entries are replaced whole, never patched, so two
//! concurrent writers for the same key simply race to last-write-wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use repost_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{SwError, SwResult};

// ==================== Keys and entries ====================

/// Normalized request identity used as a cache key.
///
/// Only GET requests are storable; the URL is kept without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    /// Key for a request, or `None` if the request is not storable.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A captured response stored under a [`RequestKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, duplicates preserved.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Bytes,

    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Capture a response for storage.
    pub fn from_response(key: RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: Utc::now(),
        }
    }

    /// Rebuild the response this entry was captured from.
    pub fn to_response(&self) -> SwResult<Response> {
        let url = Url::parse(&self.key.url)?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| SwError::Cache(format!("stored status {} invalid: {e}", self.status)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone(),
        })
    }
}

// ==================== Storage trait ====================

/// Named, persistent caches of request/response pairs.
///
/// Absence is never an error: lookups return `None` and deletes return
/// `false` when there was nothing to remove.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the cache if it does not exist.
    async fn open(&self, name: &str) -> SwResult<()>;

    async fn has(&self, name: &str) -> SwResult<bool>;

    /// Delete a cache and every entry in it.
    async fn delete_cache(&self, name: &str) -> SwResult<bool>;

    /// All cache names, in the backend's listing order.
    async fn cache_names(&self) -> SwResult<Vec<String>>;

    async fn get(&self, cache: &str, key: &RequestKey) -> SwResult<Option<CacheEntry>>;

    /// Store an entry, replacing any entry under the same key.
    ///
    /// Fails with [`SwError::CacheNotFound`] if the cache was deleted.
    async fn put(&self, cache: &str, entry: CacheEntry) -> SwResult<()>;

    async fn delete(&self, cache: &str, key: &RequestKey) -> SwResult<bool>;

    async fn keys(&self, cache: &str) -> SwResult<Vec<RequestKey>>;

    /// Look the key up in every cache, first hit wins.
    async fn match_any(&self, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        for name in self.cache_names().await? {
            if let Some(entry) = self.get(&name, key).await? {
                trace!(cache = %name, key = %key, "Cache hit");
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// Handle to one named cache.
#[derive(Clone)]
pub struct Cache {
    name: String,
    storage: Arc<dyn CacheStorage>,
}

impl Cache {
    /// Open (creating if needed) a cache by name.
    pub async fn open(storage: Arc<dyn CacheStorage>, name: &str) -> SwResult<Self> {
        storage.open(name).await?;
        Ok(Self {
            name: name.to_string(),
            storage,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        self.storage.get(&self.name, key).await
    }

    /// Capture `response` under `key`. Only successful responses are stored.
    pub async fn put(&self, key: RequestKey, response: &Response) -> SwResult<()> {
        if !response.ok() {
            return Err(SwError::Cache(format!(
                "refusing to cache {} response for {}",
                response.status, key
            )));
        }
        self.storage
            .put(&self.name, CacheEntry::from_response(key, response))
            .await
    }

    pub async fn delete(&self, key: &RequestKey) -> SwResult<bool> {
        self.storage.delete(&self.name, key).await
    }

    pub async fn keys(&self) -> SwResult<Vec<RequestKey>> {
        self.storage.keys(&self.name).await
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

// ==================== Memory backend ====================

#[derive(Debug, Default)]
struct MemoryState {
    /// Creation order, for `cache_names` and `match_any`.
    order: Vec<String>,
    caches: HashMap<String, HashMap<RequestKey, CacheEntry>>,
}

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    state: RwLock<MemoryState>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        let mut state = self.state.write().await;
        if !state.caches.contains_key(name) {
            debug!(cache = %name, "Creating cache");
            state.caches.insert(name.to_string(), HashMap::new());
            state.order.push(name.to_string());
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(self.state.read().await.caches.contains_key(name))
    }

    async fn delete_cache(&self, name: &str) -> SwResult<bool> {
        let mut state = self.state.write().await;
        state.order.retain(|n| n != name);
        Ok(state.caches.remove(name).is_some())
    }

    async fn cache_names(&self) -> SwResult<Vec<String>> {
        Ok(self.state.read().await.order.clone())
    }

    async fn get(&self, cache: &str, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state.caches.get(cache).and_then(|c| c.get(key)).cloned())
    }

    async fn put(&self, cache: &str, entry: CacheEntry) -> SwResult<()> {
        let mut state = self.state.write().await;
        let entries = state
            .caches
            .get_mut(cache)
            .ok_or_else(|| SwError::CacheNotFound(cache.to_string()))?;
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> SwResult<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .caches
            .get_mut(cache)
            .is_some_and(|c| c.remove(key).is_some()))
    }

    async fn keys(&self, cache: &str) -> SwResult<Vec<RequestKey>> {
        let state = self.state.read().await;
        Ok(state
            .caches
            .get(cache)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn ok_response(u: &str, body: &'static str) -> Response {
        Response::new(url(u), StatusCode::OK)
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/css"),
            )
            .with_body(body)
    }

    fn storage() -> Arc<dyn CacheStorage> {
        Arc::new(MemoryCacheStorage::new())
    }

    #[test]
    fn test_request_key_drops_fragment() {
        let key = RequestKey::get(&url("https://app.example/dashboard#top"));
        assert_eq!(key.url, "https://app.example/dashboard");
        assert_eq!(key.method, "GET");
    }

    #[test]
    fn test_request_key_only_for_get() {
        let post = Request::post(url("https://app.example/x"), "a=b");
        assert!(RequestKey::for_request(&post).is_none());

        let get = Request::get(url("https://app.example/x"));
        assert!(RequestKey::for_request(&get).is_some());
    }

    #[test]
    fn test_entry_round_trips_response() {
        let response = ok_response("https://app.example/app.css", "body{}");
        let entry = CacheEntry::from_response(RequestKey::get(&response.url), &response);
        let rebuilt = entry.to_response().unwrap();

        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body, Bytes::from_static(b"body{}"));
        assert_eq!(rebuilt.header("content-type"), Some("text/css"));
    }

    #[tokio::test]
    async fn test_cache_put_and_get() {
        let cache = Cache::open(storage(), "repost-static-v1").await.unwrap();
        let response = ok_response("https://app.example/app.css", "body{}");
        let key = RequestKey::get(&response.url);

        cache.put(key.clone(), &response).await.unwrap();

        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"body{}"));
        assert!(cache
            .get(&RequestKey::get(&url("https://app.example/other.css")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cache_refuses_unsuccessful_response() {
        let cache = Cache::open(storage(), "repost-static-v1").await.unwrap();
        let response = Response::new(url("https://app.example/gone.css"), StatusCode::NOT_FOUND);

        let result = cache.put(RequestKey::get(&response.url), &response).await;
        assert!(matches!(result, Err(SwError::Cache(_))));
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_entry() {
        let cache = Cache::open(storage(), "repost-api-v1").await.unwrap();
        let key = RequestKey::get(&url("https://app.example/api/posts"));

        cache
            .put(key.clone(), &ok_response("https://app.example/api/posts", "[1]"))
            .await
            .unwrap();
        cache
            .put(key.clone(), &ok_response("https://app.example/api/posts", "[1,2]"))
            .await
            .unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"[1,2]"));
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let cache = Cache::open(storage(), "v1").await.unwrap();
        let response = ok_response("https://app.example/style.css", "x");
        let key = RequestKey::get(&response.url);

        cache.put(key.clone(), &response).await.unwrap();
        assert!(cache.delete(&key).await.unwrap());
        assert!(!cache.delete(&key).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_names_in_creation_order() {
        let storage = storage();
        storage.open("b").await.unwrap();
        storage.open("a").await.unwrap();
        storage.open("b").await.unwrap();

        assert_eq!(storage.cache_names().await.unwrap(), vec!["b", "a"]);

        assert!(storage.delete_cache("b").await.unwrap());
        assert!(!storage.has("b").await.unwrap());
        assert_eq!(storage.cache_names().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_put_into_deleted_cache_fails() {
        let storage = storage();
        let cache = Cache::open(storage.clone(), "repost-v0").await.unwrap();
        storage.delete_cache("repost-v0").await.unwrap();

        let response = ok_response("https://app.example/", "<html>");
        let result = cache.put(RequestKey::get(&response.url), &response).await;

        assert!(matches!(result, Err(SwError::CacheNotFound(_))));
        assert!(!storage.has("repost-v0").await.unwrap());
    }

    #[tokio::test]
    async fn test_match_any_searches_all_caches() {
        let storage = storage();
        let shell = Cache::open(storage.clone(), "repost-v1").await.unwrap();
        Cache::open(storage.clone(), "repost-static-v1").await.unwrap();

        let response = ok_response("https://app.example/offline.html", "offline");
        let key = RequestKey::get(&response.url);
        shell.put(key.clone(), &response).await.unwrap();

        let hit = storage.match_any(&key).await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"offline"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_same_key_store_one_response() {
        let storage = storage();
        let cache = Cache::open(storage, "repost-api-v1").await.unwrap();
        let key = RequestKey::get(&url("https://app.example/api/posts"));

        let writers = (0..8).map(|writer| {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let response = Response::new(url("https://app.example/api/posts"), StatusCode::OK)
                    .with_header(
                        HeaderName::from_static("x-version"),
                        HeaderValue::from(writer as u32),
                    )
                    .with_body(format!("{writer}"));
                cache.put(key, &response).await
            })
        });
        for result in futures::future::join_all(writers).await {
            result.unwrap().unwrap();
        }

        let stored = cache.get(&key).await.unwrap().unwrap().to_response().unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 1);
        assert_eq!(
            stored.header("x-version").map(str::as_bytes),
            Some(&stored.body[..])
        );
    }
}
