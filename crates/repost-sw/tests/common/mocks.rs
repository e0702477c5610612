use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use repost_net::{Fetcher, NetError, Request, Response};
use url::Url;
use repost_sw::{
    CacheEntry, CacheStorage, ContentIntake, MemoryCacheStorage, RequestKey, ShareRecord,
    SwError, SwResult, SyncError, SyncTag, SyncTaskRunner,
};

#[derive(Clone)]
struct Route {
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
    /// Final URL after following redirects, when it differs.
    landed_at: Option<Url>,
}

/// Scripted network with an offline switch.
///
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, status: u16, content_type: &'static str, body: impl Into<Bytes>) {
        let route = Route {
            status: StatusCode::from_u16(status).unwrap(),
            content_type,
            body: body.into(),
            landed_at: None,
        };
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    /// Answer `url` as if it redirected to `landed_at` and that answered 200.
    pub fn serve_redirected(
        &self,
        url: &str,
        landed_at: &str,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) {
        let route = Route {
            status: StatusCode::OK,
            content_type,
            body: body.into(),
            landed_at: Some(Url::parse(landed_at).unwrap()),
        };
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// How many times `url` reached the network, offline attempts included.
    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.lock().unwrap().push(request.url.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        Ok(match route {
            Some(route) => Response::new(
                route.landed_at.unwrap_or_else(|| request.url.clone()),
                route.status,
            )
                .with_header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(route.content_type),
                )
                .with_body(route.body),
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND),
        })
    }
}

/// Storage whose writes always fail once `frozen` is set.
#[derive(Default)]
pub struct ReadOnlyStorage {
    inner: MemoryCacheStorage,
    frozen: AtomicBool,
}

#[allow(dead_code)]
impl ReadOnlyStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStorage for ReadOnlyStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        self.inner.has(name).await
    }

    async fn delete_cache(&self, name: &str) -> SwResult<bool> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(SwError::Cache("storage is read-only".to_string()));
        }
        self.inner.delete_cache(name).await
    }

    async fn cache_names(&self) -> SwResult<Vec<String>> {
        self.inner.cache_names().await
    }

    async fn get(&self, cache: &str, key: &RequestKey) -> SwResult<Option<CacheEntry>> {
        self.inner.get(cache, key).await
    }

    async fn put(&self, cache: &str, entry: CacheEntry) -> SwResult<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(SwError::Cache("storage is read-only".to_string()));
        }
        self.inner.put(cache, entry).await
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> SwResult<bool> {
        self.inner.delete(cache, key).await
    }

    async fn keys(&self, cache: &str) -> SwResult<Vec<RequestKey>> {
        self.inner.keys(cache).await
    }
}

/// Sync runner that fails the first `failures` runs with `error`.
pub struct FlakyRunner {
    failures: usize,
    error: SyncError,
    runs: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyRunner {
    pub fn new(failures: usize, error: SyncError) -> Arc<Self> {
        Arc::new(Self {
            failures,
            error,
            runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncTaskRunner for FlakyRunner {
    async fn run(&self, _tag: &SyncTag) -> Result<(), SyncError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

/// Content intake that keeps every record.
#[derive(Default)]
pub struct RecordingIntake {
    pub records: Mutex<Vec<ShareRecord>>,
}

#[allow(dead_code)]
impl RecordingIntake {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContentIntake for RecordingIntake {
    async fn store(&self, record: ShareRecord) -> SwResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
