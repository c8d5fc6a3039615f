//! Tracks which containers are being watched and at which address.
//!
//! The registry is fed by a one-shot snapshot at startup and by the
//! runtime's event stream afterwards, consumed by a dedicated task for
//! the registry's lifetime. Consumers either take a point-in-time
//! [`endpoints`](WatchedContainerRegistry::endpoints) projection or
//! [`subscribe`](WatchedContainerRegistry::subscribe) for add/remove
//! transitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};

use crate::docker::{ContainerInfo, ContainerRuntime};

/// Port every injected agent listens on inside its container.
pub const AGENT_PORT: u16 = 9100;
/// Scrape path served by the agent.
pub const AGENT_METRICS_PATH: &str = "/metrics";

const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// A watched container, keyed in the registry by `ip_address`.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub ip_address: String,
    pub running: bool,
    pub runtime: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// All attached networks, name to IP address.
    pub networks: HashMap<String, String>,
}

impl ContainerRecord {
    fn new(info: ContainerInfo, ip_address: String) -> Self {
        Self {
            id: info.id,
            ip_address,
            running: info.running,
            runtime: info.runtime,
            name: info.name,
            image: info.image,
            labels: info.labels,
            networks: info.networks,
        }
    }

    /// Picks the scrape address: the configured network when one is
    /// set, otherwise the attached network with the lexicographically
    /// smallest name. The runtime does not guarantee any ordering of
    /// the network collection, so "first" has to be pinned down here.
    fn select_network(info: &ContainerInfo, network_filter: Option<&str>) -> Option<String> {
        match network_filter {
            Some(name) => info.networks.get(name).cloned(),
            None => info
                .networks
                .iter()
                .min_by(|a, b| a.0.cmp(b.0))
                .map(|(_, ip)| ip.clone()),
        }
    }
}

/// A scrape target derived from a [`ContainerRecord`]; recomputed per
/// request, never stored.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ip_address: String,
    pub port: u16,
    pub path: String,
    pub tags: BTreeMap<String, String>,
}

impl Endpoint {
    fn of(record: &ContainerRecord) -> Self {
        let mut tags = BTreeMap::new();
        if let Some(service) = record.labels.get(COMPOSE_SERVICE_LABEL) {
            tags.insert("compose_service".to_owned(), service.clone());
            tags.insert(
                "compose_project".to_owned(),
                record
                    .labels
                    .get(COMPOSE_PROJECT_LABEL)
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        let name = record.name.strip_prefix('/').unwrap_or(&record.name);
        tags.insert("name".to_owned(), name.to_owned());
        tags.insert("image".to_owned(), record.image.clone());

        Self {
            ip_address: record.ip_address.clone(),
            port: AGENT_PORT,
            path: AGENT_METRICS_PATH.to_owned(),
            tags,
        }
    }
}

/// An add/remove transition delivered to subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(ContainerRecord),
    Removed(ContainerRecord),
}

/// Handed out by [`WatchedContainerRegistry::subscribe`]: the set of
/// records running at registration time plus the live event feed. The
/// two are taken atomically, so every container shows up exactly once,
/// either in `initial` or as an `Added` event.
pub struct Subscription {
    pub initial: Vec<ContainerRecord>,
    pub events: mpsc::Receiver<RegistryEvent>,
}

struct Inner {
    runtime: Arc<dyn ContainerRuntime>,
    containers: DashMap<String, ContainerRecord>,
    /// All map mutation and event fan-out happens under this lock;
    /// that is what makes the subscribe-time snapshot race free.
    subscribers: Mutex<Vec<mpsc::Sender<RegistryEvent>>>,
    runtime_filter: Option<String>,
    network_filter: Option<String>,
}

impl Inner {
    async fn on_health_or_snapshot(&self, container_id: &str) {
        let info = match self.runtime.inspect_container(container_id).await {
            Ok(info) => info,
            Err(err) => {
                log::warn!("skipping container `{container_id}`: inspection failed: {err}");
                return;
            }
        };
        if let Some(filter) = &self.runtime_filter {
            if info.runtime != *filter {
                return;
            }
        }
        let Some(ip_address) =
            ContainerRecord::select_network(&info, self.network_filter.as_deref())
        else {
            log::warn!(
                "container `{container_id}` has no usable network attachment, not watching"
            );
            return;
        };

        let record = ContainerRecord::new(info, ip_address.clone());
        let mut subscribers = self.subscribers.lock().await;
        let previous = self.containers.insert(ip_address, record.clone());
        let newly_added = match previous {
            Some(prev) => !prev.running,
            None => true,
        };
        if newly_added {
            log::info!(
                "watching container `{}` ({}) at {}",
                record.id,
                record.name,
                record.ip_address
            );
            broadcast(&mut subscribers, RegistryEvent::Added(record)).await;
        }
    }

    async fn on_die(&self, container_id: &str) {
        // Best effort: the container may already be gone.
        let info = match self.runtime.inspect_container(container_id).await {
            Ok(info) => info,
            Err(err) => {
                log::debug!("cannot inspect dying container `{container_id}`: {err}");
                return;
            }
        };
        if let Some(filter) = &self.runtime_filter {
            if info.runtime != *filter {
                return;
            }
        }
        let mut subscribers = self.subscribers.lock().await;
        for ip_address in info.networks.values() {
            if let Some((_, removed)) = self.containers.remove(ip_address) {
                log::info!(
                    "container `{}` at {} is gone, no longer watching",
                    removed.id,
                    removed.ip_address
                );
                broadcast(&mut subscribers, RegistryEvent::Removed(removed)).await;
            }
        }
    }
}

async fn broadcast(subscribers: &mut Vec<mpsc::Sender<RegistryEvent>>, event: RegistryEvent) {
    let mut i = 0;
    while i < subscribers.len() {
        if subscribers[i].send(event.clone()).await.is_err() {
            // Receiver went away, drop the subscription.
            subscribers.remove(i);
        } else {
            i += 1;
        }
    }
}

pub struct WatchedContainerRegistry {
    inner: Arc<Inner>,
    stop_tx: watch::Sender<bool>,
}

impl WatchedContainerRegistry {
    /// Consumes the initial container listing, then spawns the
    /// event-consumption task. Fails only when the listing or the event
    /// subscription itself cannot be established; individual container
    /// inspections are skipped on error.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        label: &str,
        runtime_filter: Option<String>,
        network_filter: Option<String>,
    ) -> crate::docker::Result<Self> {
        let inner = Arc::new(Inner {
            runtime: Arc::clone(&runtime),
            containers: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            runtime_filter,
            network_filter,
        });

        for container in runtime.list_containers(label).await? {
            inner.on_health_or_snapshot(&container.id).await;
        }

        let mut events = runtime.events(label, &["health_status", "die"]).await?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        event = events.recv() => {
                            let Some(event) = event else {
                                log::warn!("runtime event stream closed, container discovery stalled");
                                break;
                            };
                            if !event.is_container() {
                                continue;
                            }
                            if event.is_health_status() {
                                inner.on_health_or_snapshot(&event.actor_id).await;
                            } else if event.is_die() {
                                inner.on_die(&event.actor_id).await;
                            }
                        }
                    }
                }
                log::debug!("registry event task stopped");
            });
        }

        Ok(Self { inner, stop_tx })
    }

    /// Atomically returns the currently-running records and a channel
    /// for later transitions.
    pub async fn subscribe(&self) -> Subscription {
        let mut subscribers = self.inner.subscribers.lock().await;
        let initial: Vec<ContainerRecord> = self
            .inner
            .containers
            .iter()
            .filter(|entry| entry.value().running)
            .map(|entry| entry.value().clone())
            .collect();
        let (tx, rx) = mpsc::channel(32);
        subscribers.push(tx);

        Subscription {
            initial,
            events: rx,
        }
    }

    /// Point-in-time scrape target list.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .containers
            .iter()
            .map(|entry| Endpoint::of(entry.value()))
            .collect()
    }

    /// Signals the event task to terminate. Cooperative: an event
    /// already being handled finishes first.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
