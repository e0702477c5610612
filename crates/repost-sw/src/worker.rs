//! The offline worker: one handler per worker event.

use std::sync::Arc;

use futures::future::try_join_all;
use repost_net::{CacheMode, Fetcher, Request, RequestDestination, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::background::{
    click_target, LoggingSyncRunner, NotificationClick, PushPayload, SyncTag, SyncTaskRunner,
};
use crate::cache::{Cache, CacheStorage, RequestKey};
use crate::classify::{classify, RequestClass};
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::lifecycle::ServiceWorkerId;
use crate::message::{control_action, ControlAction};
use crate::notifications::{Notification, Notifications};
use crate::policy::{self, FetchResponse, PolicyContext};
use crate::share::{handle_share_target, ContentIntake};
use crate::{SwError, SwResult};

/// Host-side surfaces the worker acts on.
#[derive(Debug, Default)]
pub struct HostContext {
    pub clients: RwLock<Clients>,
    pub notifications: RwLock<Notifications>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of intercepting a request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker produced the response.
    Respond(FetchResponse),
    /// Not intercepted; the caller fetches it directly.
    Passthrough,
}

/// Builder for [`OfflineWorker`].
pub struct OfflineWorkerBuilder {
    config: WorkerConfig,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    sync_runner: Arc<dyn SyncTaskRunner>,
    content_intake: Option<Arc<dyn ContentIntake>>,
}

impl OfflineWorkerBuilder {
    pub fn sync_runner(mut self, runner: Arc<dyn SyncTaskRunner>) -> Self {
        self.sync_runner = runner;
        self
    }

    pub fn content_intake(mut self, intake: Arc<dyn ContentIntake>) -> Self {
        self.content_intake = Some(intake);
        self
    }

    /// Validate the configuration and build the worker.
    pub fn build(self) -> SwResult<OfflineWorker> {
        self.config.validate()?;
        Ok(OfflineWorker {
            ctx: PolicyContext {
                config: Arc::new(self.config),
                caches: self.caches,
                fetcher: self.fetcher,
            },
            sync_runner: self.sync_runner,
            content_intake: self.content_intake,
        })
    }
}

/// The offline caching worker.
pub struct OfflineWorker {
    ctx: PolicyContext,
    sync_runner: Arc<dyn SyncTaskRunner>,
    content_intake: Option<Arc<dyn ContentIntake>>,
}

impl OfflineWorker {
    pub fn builder(
        config: WorkerConfig,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> OfflineWorkerBuilder {
        OfflineWorkerBuilder {
            config,
            caches,
            fetcher,
            sync_runner: Arc::new(LoggingSyncRunner),
            content_intake: None,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.ctx.caches
    }

    // ==================== Install ====================

    /// Pre-warm the caches. Returns whether the worker asks to skip waiting.
    #[instrument(skip(self), fields(origin = %self.ctx.config.origin))]
    pub async fn on_install(&self) -> SwResult<bool> {
        let (_, _, skip_waiting) = tokio::try_join!(
            self.precache_manifest(),
            self.seed_offline_page(),
            async { Ok::<_, SwError>(self.ctx.config.skip_waiting_on_install) },
        )?;
        info!(skip_waiting, "Install complete");
        Ok(skip_waiting)
    }

    async fn fetch_for_precache(&self, request: Request) -> SwResult<(RequestKey, Response)> {
        let response = self
            .ctx
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| SwError::Precache {
                url: request.url.to_string(),
                reason: e.to_string(),
            })?;
        if !response.ok() {
            return Err(SwError::Precache {
                url: request.url.to_string(),
                reason: format!("status {}", response.status),
            });
        }
        Ok((RequestKey::get(&request.url), response))
    }

    /// Fetch every manifest URL; store them only once all succeeded.
    async fn precache_manifest(&self) -> SwResult<()> {
        let config = &self.ctx.config;
        let cache = Cache::open(self.ctx.caches.clone(), &config.static_cache.name()).await?;

        let requests = config
            .precache_urls
            .iter()
            .map(|path| -> SwResult<Request> {
                let url = config.resolve(path)?;
                let destination = RequestDestination::from_path(url.path());
                Ok(Request::get(url).destination(destination))
            })
            .collect::<SwResult<Vec<_>>>()?;

        let fetched =
            try_join_all(requests.into_iter().map(|r| self.fetch_for_precache(r))).await?;

        let count = fetched.len();
        for (key, response) in fetched {
            cache.put(key, &response).await?;
        }
        debug!(cache = %cache.name(), count, "Precached manifest");
        Ok(())
    }

    async fn seed_offline_page(&self) -> SwResult<()> {
        let config = &self.ctx.config;
        let cache = Cache::open(self.ctx.caches.clone(), &config.shell_cache.name()).await?;
        let request = Request::get(config.offline_page_url()?)
            .destination(RequestDestination::Document)
            .cache_mode(CacheMode::Reload);

        let (key, response) = self.fetch_for_precache(request).await?;
        cache.put(key, &response).await?;
        debug!(cache = %cache.name(), "Seeded offline page");
        Ok(())
    }

    // ==================== Activate ====================

    /// Drop stale cache generations and take control of open windows.
    ///
    /// Returns the ids of the clients that changed controller.
    #[instrument(skip(self, host))]
    pub async fn on_activate(
        &self,
        id: ServiceWorkerId,
        host: &HostContext,
    ) -> SwResult<Vec<String>> {
        let (deleted, claimed) = tokio::try_join!(self.prune_caches(), async {
            Ok::<_, SwError>(host.clients.write().await.claim(id))
        })?;
        info!(deleted = ?deleted, claimed = claimed.len(), "Activation complete");
        Ok(claimed)
    }

    /// Delete every cache that is not a current generation.
    async fn prune_caches(&self) -> SwResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.ctx.caches.cache_names().await? {
            if self.ctx.config.is_current_cache(&name) {
                continue;
            }
            if self.ctx.caches.delete_cache(&name).await? {
                info!(cache = %name, "Deleted stale cache generation");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    // ==================== Fetch ====================

    /// Route one intercepted request.
    pub async fn on_fetch(&self, request: &Request) -> SwResult<FetchOutcome> {
        let response = match classify(request, &self.ctx.config) {
            RequestClass::Ignored => return Ok(FetchOutcome::Passthrough),
            RequestClass::Api => policy::network_first(&self.ctx, request).await,
            RequestClass::Navigation => policy::navigate_with_fallback(&self.ctx, request).await,
            RequestClass::Static => policy::cache_first(&self.ctx, request).await?,
            RequestClass::ShareTarget => {
                let redirect = handle_share_target(
                    &self.ctx.config,
                    self.content_intake.as_deref(),
                    request,
                )
                .await?;
                FetchResponse::synthesized(redirect)
            }
        };
        Ok(FetchOutcome::Respond(response))
    }

    // ==================== Background events ====================

    /// Run the task behind a sync tag. Unknown tags succeed without work.
    pub async fn on_sync(&self, tag: &str) -> SwResult<()> {
        let tag = SyncTag::parse(tag);
        if !tag.is_known() {
            debug!(tag = %tag, "No task for sync tag");
            return Ok(());
        }

        info!(tag = %tag, "Running sync task");
        self.sync_runner
            .run(&tag)
            .await
            .map_err(|source| SwError::Sync {
                tag: tag.to_string(),
                source,
            })
    }

    /// Show a notification for a push message.
    pub async fn on_push(&self, data: Option<&[u8]>, host: &HostContext) -> Notification {
        let notification = PushPayload::parse(data).to_notification(&self.ctx.config);
        host.notifications.write().await.show(notification.clone());
        notification
    }

    /// Close the notification and follow its `explore` action.
    ///
    /// Returns the window that was focused or opened, if any.
    pub async fn on_notification_click(
        &self,
        click: &NotificationClick,
        host: &HostContext,
    ) -> SwResult<Option<Client>> {
        let closed = host
            .notifications
            .write()
            .await
            .close(click.notification_id);
        if closed.is_none() {
            warn!(id = click.notification_id, "Clicked notification was not shown");
        }

        if !click.is_explore() {
            return Ok(None);
        }

        let target = click_target(&self.ctx.config, closed.as_ref().map(|n| &n.data))?;
        self.focus_or_open(&target, host).await.map(Some)
    }

    async fn focus_or_open(&self, target: &Url, host: &HostContext) -> SwResult<Client> {
        let mut clients = host.clients.write().await;
        let existing = clients.find_window(target).map(|c| c.id.clone());
        match existing {
            Some(id) => {
                debug!(client = %id, url = %target, "Focusing existing window");
                clients.focus(&id)
            }
            None => Ok(clients.open_window(target.clone())),
        }
    }

    pub fn on_message(&self, data: &serde_json::Value) -> ControlAction {
        control_action(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use repost_net::OfflineFetcher;

    fn worker() -> OfflineWorker {
        let config = WorkerConfig::for_origin(Url::parse("https://app.example/").unwrap());
        OfflineWorker::builder(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(OfflineFetcher),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn test_builder_validates_config() {
        let mut config = WorkerConfig::default();
        config.offline_page = "offline.html".to_string();
        let result = OfflineWorker::builder(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(OfflineFetcher),
        )
        .build();
        assert!(matches!(result, Err(SwError::Config(_))));
    }

    #[tokio::test]
    async fn test_install_fails_offline() {
        let result = worker().on_install().await;
        assert!(matches!(result, Err(SwError::Precache { .. })));
    }

    #[tokio::test]
    async fn test_unknown_sync_tag_is_noop() {
        assert!(worker().on_sync("periodic-cleanup").await.is_ok());
        assert!(worker().on_sync("content-sync").await.is_ok());
    }

    #[tokio::test]
    async fn test_post_elsewhere_passes_through() {
        let request = Request::post(Url::parse("https://app.example/login").unwrap(), "");
        let outcome = worker().on_fetch(&request).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough));
    }

    #[tokio::test]
    async fn test_close_action_only_closes() {
        let worker = worker();
        let host = HostContext::new();
        let notification = worker.on_push(None, &host).await;

        let opened = worker
            .on_notification_click(&NotificationClick::action(notification.id, "close"), &host)
            .await
            .unwrap();

        assert!(opened.is_none());
        assert!(host.notifications.read().await.all().is_empty());
        assert!(host.clients.read().await.is_empty());
    }
}
