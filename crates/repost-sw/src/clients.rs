//! Pages the worker can see and control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;
use crate::{SwError, SwResult};

/// Client type. Only windows can be focused or claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Window,
    Worker,
}

/// A page or worker context.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,

    pub url: Url,

    pub client_type: ClientType,

    pub focused: bool,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A window at `url`, not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    pub fn is_window(&self) -> bool {
        self.client_type == ClientType::Window
    }
}

/// Registry of clients, in the order they appeared.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    order: Vec<String>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn add(&mut self, client: Client) {
        if !self.clients.contains_key(&client.id) {
            self.order.push(client.id.clone());
        }
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.order.retain(|c| c != id);
        self.clients.remove(id)
    }

    /// Open and focus a new window. Other windows lose focus.
    pub fn open_window(&mut self, url: Url) -> Client {
        self.blur_all();
        let mut client = Client::window(url);
        client.focused = true;
        debug!(client = %client.id, url = %client.url, "Opened window");
        self.add(client.clone());
        client
    }

    /// First window showing exactly `url`.
    pub fn find_window(&self, url: &Url) -> Option<&Client> {
        self.order
            .iter()
            .filter_map(|id| self.clients.get(id))
            .find(|c| c.is_window() && c.url == *url)
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> SwResult<Client> {
        let is_window = self
            .clients
            .get(id)
            .ok_or_else(|| SwError::State(format!("no client {id}")))?
            .is_window();
        if !is_window {
            return Err(SwError::State("can only focus window clients".to_string()));
        }

        self.blur_all();
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| SwError::State(format!("no client {id}")))?;
        client.focused = true;
        Ok(client.clone())
    }

    /// Make `worker` the controller of every window; returns the claimed ids.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut claimed = Vec::new();
        for id in &self.order {
            if let Some(client) = self.clients.get_mut(id) {
                if client.is_window() && client.controller != Some(worker) {
                    client.controller = Some(worker);
                    claimed.push(id.clone());
                }
            }
        }
        claimed
    }

    fn blur_all(&mut self) {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!(
        "client-{nanos:016x}-{:04x}",
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_open_window_focuses() {
        let mut clients = Clients::new();
        let first = clients.open_window(url("https://app.example/dashboard"));
        let second = clients.open_window(url("https://app.example/dashboard/content"));

        assert!(!clients.get(&first.id).unwrap().focused);
        assert!(clients.get(&second.id).unwrap().focused);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_find_and_focus_window() {
        let mut clients = Clients::new();
        let target = clients.open_window(url("https://app.example/dashboard/schedule"));
        clients.open_window(url("https://app.example/dashboard"));

        let found = clients
            .find_window(&url("https://app.example/dashboard/schedule"))
            .unwrap()
            .id
            .clone();
        assert_eq!(found, target.id);

        let focused = clients.focus(&found).unwrap();
        assert!(focused.focused);
        assert!(clients.find_window(&url("https://app.example/other")).is_none());
    }

    #[test]
    fn test_focus_rejects_non_window() {
        let mut clients = Clients::new();
        let mut worker = Client::window(url("https://app.example/worker.js"));
        worker.client_type = ClientType::Worker;
        let id = worker.id.clone();
        clients.add(worker);

        assert!(matches!(clients.focus(&id), Err(SwError::State(_))));
        assert!(matches!(clients.focus("missing"), Err(SwError::State(_))));
    }

    #[test]
    fn test_claim_sets_controller_once() {
        let mut clients = Clients::new();
        let a = Client::window(url("https://app.example/a"));
        let b = Client::window(url("https://app.example/b"));
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        clients.add(a);
        clients.add(b);
        let worker = ServiceWorkerId::new();

        assert_eq!(clients.claim(worker), vec![a_id.clone(), b_id.clone()]);
        assert!(clients.claim(worker).is_empty());
        assert_eq!(clients.get(&a_id).unwrap().controller, Some(worker));
        assert_eq!(clients.get(&b_id).unwrap().controller, Some(worker));
    }

    #[test]
    fn test_claim_skips_non_window_clients() {
        let mut clients = Clients::new();
        let mut worker_client = Client::window(url("https://app.example/sync.js"));
        worker_client.client_type = ClientType::Worker;
        let id = worker_client.id.clone();
        clients.add(worker_client);

        assert!(clients.claim(ServiceWorkerId::new()).is_empty());
        assert!(clients.get(&id).unwrap().controller.is_none());
    }
}
