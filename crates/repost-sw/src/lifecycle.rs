//! Worker lifecycle: registration, install, activation, event dispatch.
//!
//! At most one worker is active at a time. A new worker installs alongside the
//! active one and only replaces it after both install and activation
//! succeeded; any failure marks the new worker redundant and the previous one
//! keeps serving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use repost_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::background::NotificationClick;
use crate::clients::Client;
use crate::message::ControlAction;
use crate::notifications::Notification;
use crate::policy::FetchResponse;
use crate::worker::{FetchOutcome, HostContext, OfflineWorker};
use crate::{SwError, SwResult};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Registered, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install/activation failed.
    Redundant,
}

/// A registered worker and its state.
#[derive(Clone)]
pub struct WorkerRecord {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    pub worker: Arc<OfflineWorker>,
    pub state_changed_at: Instant,
}

impl WorkerRecord {
    fn new(worker: OfflineWorker) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            worker: Arc::new(worker),
            state_changed_at: Instant::now(),
        }
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// The installing, waiting and active slots.
#[derive(Debug, Default)]
pub struct ServiceWorkerRegistration {
    /// Origin of the registered worker.
    pub scope: Option<Url>,

    pub installing: Option<WorkerRecord>,

    pub waiting: Option<WorkerRecord>,

    pub active: Option<WorkerRecord>,

    /// Last known state of every worker ever registered.
    history: HashMap<ServiceWorkerId, ServiceWorkerState>,
}

impl ServiceWorkerRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.history.get(&id).copied()
    }

    fn record(&mut self, worker: &mut WorkerRecord, state: ServiceWorkerState) {
        worker.set_state(state);
        self.history.insert(worker.id, state);
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by `worker_id`.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Owns the registration and routes page and platform events to the active
/// worker.
pub struct ServiceWorkerContainer {
    registration: RwLock<ServiceWorkerRegistration>,

    host: Arc<HostContext>,

    /// Network used for requests no worker handles.
    network: Arc<dyn Fetcher>,

    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    pub fn new(network: Arc<dyn Fetcher>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new()),
                host: Arc::new(HostContext::new()),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.event_tx.send(event);
    }

    async fn transition(&self, worker: &mut WorkerRecord, state: ServiceWorkerState) {
        self.registration.write().await.record(worker, state);
        debug!(worker = ?worker.id, ?state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            new_state: state,
        });
    }

    // ==================== Registration ====================

    /// Install a worker and, if possible, activate it.
    ///
    /// The worker is activated right away when it asked to skip waiting or no
    /// worker is active; otherwise it stays waiting.
    pub async fn register(&self, worker: OfflineWorker) -> SwResult<ServiceWorkerId> {
        let mut record = WorkerRecord::new(worker);
        let id = record.id;
        let scope = record.worker.config().origin.clone();
        info!(worker = ?id, scope = %scope, "Registering worker");

        {
            let mut registration = self.registration.write().await;
            registration.scope = Some(scope);
            let state = record.state;
            registration.record(&mut record, state);
            if let Some(mut previous) = registration.installing.take() {
                registration.record(&mut previous, ServiceWorkerState::Redundant);
            }
        }
        self.emit(ServiceWorkerEvent::UpdateFound { worker_id: id });
        self.transition(&mut record, ServiceWorkerState::Installing)
            .await;
        self.registration.write().await.installing = Some(record.clone());

        let skip_waiting = match record.worker.on_install().await {
            Ok(skip) => skip,
            Err(e) => {
                warn!(worker = ?id, error = %e, "Install failed, worker is redundant");
                self.discard_installing(id).await;
                self.transition(&mut record, ServiceWorkerState::Redundant)
                    .await;
                return Err(e);
            }
        };

        if !self.discard_installing(id).await {
            // Superseded by a newer registration while installing.
            return Err(SwError::State(format!("worker {id:?} was superseded")));
        }
        self.transition(&mut record, ServiceWorkerState::Installed)
            .await;

        let activate_now = {
            let mut registration = self.registration.write().await;
            if let Some(mut previous) = registration.waiting.replace(record) {
                registration.record(&mut previous, ServiceWorkerState::Redundant);
            }
            skip_waiting || registration.active.is_none()
        };

        if activate_now {
            self.activate_waiting().await?;
        } else {
            info!(worker = ?id, "Worker installed and waiting");
        }
        Ok(id)
    }

    /// Clear the installing slot if it still holds `id`.
    async fn discard_installing(&self, id: ServiceWorkerId) -> bool {
        let mut registration = self.registration.write().await;
        match &registration.installing {
            Some(current) if current.id == id => {
                registration.installing = None;
                true
            }
            _ => false,
        }
    }

    /// Activate the waiting worker.
    pub async fn activate_waiting(&self) -> SwResult<()> {
        let (mut record, previous) = {
            let mut registration = self.registration.write().await;
            let record = registration
                .waiting
                .take()
                .ok_or_else(|| SwError::State("no waiting worker".to_string()))?;
            (record, registration.active.as_ref().map(|a| a.id))
        };
        let id = record.id;

        self.transition(&mut record, ServiceWorkerState::Activating)
            .await;

        let claimed = match record.worker.on_activate(id, &self.host).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(worker = ?id, error = %e, "Activation failed, keeping previous worker");
                if let Some(previous) = previous {
                    self.host.clients.write().await.claim(previous);
                }
                self.transition(&mut record, ServiceWorkerState::Redundant)
                    .await;
                return Err(e);
            }
        };

        let replaced = {
            let mut registration = self.registration.write().await;
            let replaced = registration.active.take();
            registration.active = Some(record.clone());
            replaced
        };
        if let Some(mut old) = replaced {
            self.transition(&mut old, ServiceWorkerState::Redundant)
                .await;
        }
        self.transition(&mut record, ServiceWorkerState::Activated)
            .await;
        self.registration.write().await.active = Some(record);

        for client_id in claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: id,
            });
        }
        info!(worker = ?id, "Worker activated");
        Ok(())
    }

    /// Mark every worker redundant.
    pub async fn unregister(&self) -> bool {
        let workers: Vec<WorkerRecord> = {
            let mut registration = self.registration.write().await;
            registration.scope = None;
            [
                registration.installing.take(),
                registration.waiting.take(),
                registration.active.take(),
            ]
            .into_iter()
            .flatten()
            .collect()
        };
        let any = !workers.is_empty();
        for mut worker in workers {
            self.transition(&mut worker, ServiceWorkerState::Redundant)
                .await;
        }
        any
    }

    // ==================== Accessors ====================

    pub async fn active(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    pub async fn installing(&self) -> Option<ServiceWorkerId> {
        self.registration
            .read()
            .await
            .installing
            .as_ref()
            .map(|w| w.id)
    }

    pub async fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.registration.read().await.state_of(id)
    }

    pub async fn scope(&self) -> Option<Url> {
        self.registration.read().await.scope.clone()
    }

    async fn active_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.worker.clone())
    }

    async fn require_active(&self) -> SwResult<Arc<OfflineWorker>> {
        self.active_worker()
            .await
            .ok_or_else(|| SwError::State("no active worker".to_string()))
    }

    // ==================== Event dispatch ====================

    /// Deliver a page message. Goes to the waiting worker if there is one.
    pub async fn post_message(&self, data: &serde_json::Value) -> SwResult<ControlAction> {
        let target = {
            let registration = self.registration.read().await;
            registration
                .waiting
                .as_ref()
                .or(registration.active.as_ref())
                .map(|w| w.worker.clone())
        };
        let Some(worker) = target else {
            debug!("Message posted with no worker registered");
            return Ok(ControlAction::None);
        };

        let action = worker.on_message(data);
        if action == ControlAction::SkipWaiting && self.waiting().await.is_some() {
            self.activate_waiting().await?;
        }
        Ok(action)
    }

    /// Answer a request the page made.
    pub async fn handle_fetch(&self, request: &Request) -> SwResult<FetchResponse> {
        if let Some(worker) = self.active_worker().await {
            if let FetchOutcome::Respond(response) = worker.on_fetch(request).await? {
                return Ok(response);
            }
        }
        let response = self.network.fetch(request).await?;
        Ok(FetchResponse::network(response))
    }

    pub async fn dispatch_sync(&self, tag: &str) -> SwResult<()> {
        self.require_active().await?.on_sync(tag).await
    }

    pub async fn dispatch_push(&self, data: Option<&[u8]>) -> SwResult<Notification> {
        let worker = self.require_active().await?;
        Ok(worker.on_push(data, &self.host).await)
    }

    pub async fn dispatch_notification_click(
        &self,
        click: &NotificationClick,
    ) -> SwResult<Option<Client>> {
        self.require_active()
            .await?
            .on_notification_click(click, &self.host)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }

    #[test]
    fn test_registration_history() {
        let mut registration = ServiceWorkerRegistration::new();
        let id = ServiceWorkerId::new();
        registration.history.insert(id, ServiceWorkerState::Installed);

        assert_eq!(registration.state_of(id), Some(ServiceWorkerState::Installed));
        assert_eq!(registration.state_of(ServiceWorkerId::new()), None);
    }

    #[tokio::test]
    async fn test_empty_container() {
        let (container, _rx) = ServiceWorkerContainer::new(Arc::new(repost_net::OfflineFetcher));

        assert!(container.active().await.is_none());
        assert!(matches!(
            container.dispatch_sync("content-sync").await,
            Err(SwError::State(_))
        ));
        assert!(matches!(
            container.activate_waiting().await,
            Err(SwError::State(_))
        ));
        assert!(!container.unregister().await);
    }
}
