//! Repost smoke harness.
//!
//! Registers the offline worker against a running dashboard, optionally cuts
//! the network, replays a list of paths through the worker and prints a JSON
//! summary on stdout. Logs go to stderr.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use repost_common::{init_logging, with_timeout, LogConfig, LogFormat, OptionExt, ResultExt};
use repost_net::{
    Fetcher, LoaderConfig, NetError, OfflineFetcher, Request, RequestDestination, ResourceLoader,
    Response,
};
use repost_sw::{
    CacheStorage, DiskCacheStorage, MemoryCacheStorage, OfflineWorker, ServiceWorkerContainer,
    WorkerConfig,
};
use serde_json::json;
use tracing::{error, info};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "repost-smoke")]
#[command(about = "Exercise the Repost offline worker against a live origin")]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the worker and replay paths through it
    Run {
        /// Origin the dashboard is served from
        #[arg(long)]
        origin: Url,

        /// Worker configuration file (JSON); its origin is overridden by --origin
        #[arg(long)]
        config: Option<PathBuf>,

        /// Persist caches under this directory instead of memory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Cut the network after install, before replaying
        #[arg(long)]
        offline: bool,

        /// Per-request timeout in milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Paths to replay; defaults to the precache manifest
        paths: Vec<String>,
    },

    /// List cache generations stored under a directory
    Caches {
        #[arg(long)]
        cache_dir: PathBuf,
    },
}

/// Network that can be switched off at runtime.
struct SwitchableNetwork {
    online: ResourceLoader,
    offline: AtomicBool,
}

#[async_trait]
impl Fetcher for SwitchableNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::Relaxed) {
            OfflineFetcher.fetch(request).await
        } else {
            self.online.fetch(request).await
        }
    }
}

/// Per-operation timing collector.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();
        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }
            let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = ms.iter().sum();
            let round = |v: f64| (v * 100.0).round() / 100.0;
            summary.insert(
                op.to_string(),
                json!({
                    "count": ms.len(),
                    "total_ms": round(total_ms),
                    "avg_ms": round(total_ms / ms.len() as f64),
                    "min_ms": round(ms.iter().copied().fold(f64::INFINITY, f64::min)),
                    "max_ms": round(ms.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
                }),
            );
        }
        serde_json::Value::Object(summary)
    }
}

/// Navigation for extension-less paths, a subresource fetch otherwise.
fn replay_request(url: Url) -> Request {
    let has_extension = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|last| last.contains('.'));
    if has_extension {
        let destination = RequestDestination::from_path(url.path());
        Request::get(url).destination(destination)
    } else {
        Request::navigate(url)
    }
}

async fn open_storage(cache_dir: Option<&PathBuf>) -> repost_common::Result<Arc<dyn CacheStorage>> {
    let storage: Arc<dyn CacheStorage> = match cache_dir {
        Some(dir) => Arc::new(
            DiskCacheStorage::open_root(dir)
                .await
                .context(format!("opening cache directory {}", dir.display()))?,
        ),
        None => Arc::new(MemoryCacheStorage::new()),
    };
    Ok(storage)
}

async fn run(
    origin: Url,
    config_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    offline: bool,
    timeout: Duration,
    paths: Vec<String>,
) -> repost_common::Result<serde_json::Value> {
    let start = Instant::now();
    let mut perf = PerfTiming::default();

    let mut config = match config_path {
        Some(path) => WorkerConfig::load(&path)?,
        None => WorkerConfig::default(),
    };
    config.origin = origin;
    config.validate()?;

    let network = Arc::new(SwitchableNetwork {
        online: ResourceLoader::new(LoaderConfig::default()).context("building HTTP client")?,
        offline: AtomicBool::new(false),
    });
    let storage = open_storage(cache_dir.as_ref()).await?;
    let paths = if paths.is_empty() {
        config.precache_urls.clone()
    } else {
        paths
    };

    let worker = OfflineWorker::builder(config.clone(), storage.clone(), network.clone()).build()?;
    let (container, _events) = ServiceWorkerContainer::new(network.clone());

    let install_start = Instant::now();
    container.register(worker).await?;
    perf.record("install", install_start.elapsed());
    let worker_id = container.active().await.ok_or_not_found("active worker")?;
    info!(worker = ?worker_id, "Worker active");

    if offline {
        network.offline.store(true, Ordering::Relaxed);
        info!("Network disabled");
    }

    let mut results = Vec::with_capacity(paths.len());
    let mut failures = 0;
    for path in &paths {
        let request = replay_request(config.resolve(path)?);
        let fetch_start = Instant::now();
        let outcome = with_timeout(timeout, || container.handle_fetch(&request)).await;
        let elapsed = fetch_start.elapsed();
        perf.record("fetch", elapsed);

        let entry = match outcome {
            Ok(Ok(fetched)) => json!({
                "path": path,
                "status": fetched.response.status.as_u16(),
                "source": fetched.source,
                "bytes": fetched.response.body.len(),
                "elapsed_ms": elapsed.as_millis(),
            }),
            Ok(Err(e)) => {
                failures += 1;
                error!(path = %path, error = %e, "Request failed");
                json!({ "path": path, "error": e.to_string() })
            }
            Err(e) => {
                failures += 1;
                error!(path = %path, error = %e, "Request timed out");
                json!({ "path": path, "error": e.to_string() })
            }
        };
        results.push(entry);
    }

    let caches = storage.cache_names().await?;
    Ok(json!({
        "status": if failures == 0 { "pass" } else { "fail" },
        "origin": config.origin.as_str(),
        "offline": offline,
        "caches": caches,
        "requests": results,
        "elapsed_ms": start.elapsed().as_millis(),
        "perf": perf.summary(),
    }))
}

async fn list_caches(cache_dir: PathBuf) -> repost_common::Result<serde_json::Value> {
    let storage = DiskCacheStorage::open_root(&cache_dir)
        .await
        .context(format!("opening cache directory {}", cache_dir.display()))?;

    let mut caches = Vec::new();
    for name in storage.cache_names().await? {
        let entries = storage.keys(&name).await?.len();
        caches.push(json!({ "name": name, "entries": entries }));
    }
    Ok(json!({ "root": cache_dir.display().to_string(), "caches": caches }))
}

#[tokio::main]
async fn main() -> repost_common::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default().with_filter("repost_sw=info,repost_smoke=info,warn")
    };
    init_logging(log_config.with_format(cli.log_format))?;

    let report = match cli.command {
        Command::Run {
            origin,
            config,
            cache_dir,
            offline,
            timeout_ms,
            paths,
        } => {
            run(
                origin,
                config,
                cache_dir,
                offline,
                Duration::from_millis(timeout_ms),
                paths,
            )
            .await?
        }
        Command::Caches { cache_dir } => list_caches(cache_dir).await?,
    };

    println!("{report}");
    Ok(())
}
