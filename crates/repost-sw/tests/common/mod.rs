pub mod mocks;

use std::sync::Arc;

use repost_sw::{CacheStorage, MemoryCacheStorage, OfflineWorker, WorkerConfig};
use url::Url;

#[allow(unused_imports)]
pub use mocks::{FlakyRunner, MockNetwork, ReadOnlyStorage, RecordingIntake};

pub const ORIGIN: &str = "https://app.repost.example/";

pub const OFFLINE_PAGE_BODY: &str = "<!doctype html><title>Offline</title><p>Reconnect to keep posting.</p>";

pub fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
    origin().join(path).unwrap()
}

pub fn config() -> WorkerConfig {
    WorkerConfig::for_origin(origin())
}

/// A network serving every precached dashboard path.
#[allow(dead_code)]
pub fn dashboard_network() -> Arc<MockNetwork> {
    let network = MockNetwork::new();
    for path in config().precache_urls {
        let (content_type, body) = match path.as_str() {
            "/offline.html" => ("text/html", OFFLINE_PAGE_BODY.to_string()),
            "/manifest.json" => ("application/json", r#"{"name":"Repost"}"#.to_string()),
            p if p.ends_with(".png") => ("image/png", format!("PNG:{p}")),
            p => ("text/html", format!("<html>{p}</html>")),
        };
        network.serve(url(&path).as_str(), 200, content_type, body);
    }
    network
}

#[allow(dead_code)]
pub fn memory_storage() -> Arc<dyn CacheStorage> {
    Arc::new(MemoryCacheStorage::new())
}

#[allow(dead_code)]
pub fn worker(
    config: WorkerConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<MockNetwork>,
) -> OfflineWorker {
    OfflineWorker::builder(config, storage, network)
        .build()
        .unwrap()
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("repost_sw=debug")
        .with_test_writer()
        .try_init();
}
