use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use itertools::Itertools;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    ensure_root, service_key, ChangeType, ChangedEvent, Coordinator, MAX_WEIGHT, PROVIDERS_NODE,
    ROOT_PATH,
};
use crate::{client::RpcClient, config::ClientConfig, error::RegistryError};

/// A provider address known to the consumer, with its weight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedProvider {
    /// The provider's `host:port`.
    pub address: String,
    /// The provider's weight.
    pub weight: usize,
}

#[derive(Default)]
struct Cache {
    providers: HashMap<String, Vec<CachedProvider>>,
    clients: HashMap<String, RpcClient>,
}

struct ConsumerInner {
    coordinator: Arc<dyn Coordinator>,
    config: ClientConfig,
    events: mpsc::UnboundedSender<ChangedEvent>,
    cache: Mutex<Cache>,
}

/// Discovers providers from the registry and keeps a client per published service.
///
/// The consumer watches the registry root, follows each service down to its providers node, and
/// on every new provider address rebuilds that service's weighted server list. The first
/// provider of a service creates its [`RpcClient`]; later ones update it. Provider removals are
/// not acted on; connections to vanished providers fail and are retried until the process
/// restarts.
pub struct RegistryConsumer {
    inner: Arc<ConsumerInner>,
    task: JoinHandle<()>,
}

impl RegistryConsumer {
    /// Creates the registry root if missing and starts watching it.
    pub async fn start(
        coordinator: Arc<dyn Coordinator>,
        config: ClientConfig,
    ) -> Result<Self, RegistryError> {
        ensure_root(coordinator.as_ref()).await?;

        let (events, mut events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConsumerInner {
            coordinator,
            config,
            events,
            cache: Mutex::default(),
        });
        inner
            .coordinator
            .listen_children(ROOT_PATH, inner.events.clone())
            .await?;

        let task = tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = events_rx.recv().await {
                    inner.node_changed(event).await;
                }
            }
        });

        Ok(RegistryConsumer { inner, task })
    }

    /// Returns the client for `interface` at `version`, once a provider has been discovered.
    pub fn consumer(&self, interface: &str, version: &str) -> Option<RpcClient> {
        self.inner
            .lock()
            .clients
            .get(&service_key(interface, version))
            .cloned()
    }

    /// Returns the known providers of `interface` at `version`, in discovery order.
    pub fn providers(&self, interface: &str, version: &str) -> Vec<CachedProvider> {
        self.inner
            .lock()
            .providers
            .get(&service_key(interface, version))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the weighted server list of `interface` at `version`.
    ///
    /// Each provider address appears as many times as its weight.
    pub fn addresses(&self, interface: &str, version: &str) -> Vec<String> {
        expand(&self.providers(interface, version))
    }

    /// Stops watching the registry and stops every client.
    pub fn stop(&self) {
        self.task.abort();
        let clients: Vec<RpcClient> = self
            .inner
            .lock()
            .clients
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in clients {
            client.stop();
        }
    }
}

impl Drop for RegistryConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RegistryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.inner.lock();
        f.debug_struct("RegistryConsumer")
            .field("services", &cache.providers.keys().sorted().collect::<Vec<_>>())
            .finish()
    }
}

impl ConsumerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn node_changed(&self, event: ChangedEvent) {
        if event.change != ChangeType::ChildAdded {
            debug!(path = %event.path, change = ?event.change, "ignoring registry change");
            return;
        }

        let segments: Vec<&str> = event.path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            [_, _] => self.listen(&event.path).await,
            [_, _, node] if *node == PROVIDERS_NODE => self.listen(&event.path).await,
            [_, key, node, address] if *node == PROVIDERS_NODE => {
                self.provider_added(key, address, &event.path, &event.data);
            }
            _ => {}
        }
    }

    async fn listen(&self, path: &str) {
        debug!(%path, "watching registry node");
        if let Err(err) = self
            .coordinator
            .listen_children(path, self.events.clone())
            .await
        {
            error!(%path, %err, "failed to watch registry node");
        }
    }

    fn provider_added(&self, key: &str, address: &str, path: &str, data: &str) {
        let weight = match parse_weight(path, data) {
            Ok(weight) => weight,
            Err(err) => {
                warn!(%err, "skipping provider");
                return;
            }
        };

        let mut cache = self.lock();
        let providers = cache.providers.entry(key.to_string()).or_default();
        match providers.iter_mut().find(|p| p.address == address) {
            Some(existing) => existing.weight = weight,
            None => providers.push(CachedProvider {
                address: address.to_string(),
                weight,
            }),
        }
        let urls = expand(providers);
        info!(service = %key, %address, weight, servers = urls.len(), "discovered provider");

        match cache.clients.get(key) {
            Some(client) => client.update_servers(&urls),
            None => {
                let client = RpcClient::new(self.config.clone());
                client.update_servers(&urls);
                cache.clients.insert(key.to_string(), client);
            }
        }
    }
}

fn expand(providers: &[CachedProvider]) -> Vec<String> {
    providers
        .iter()
        .flat_map(|provider| itertools::repeat_n(provider.address.clone(), provider.weight))
        .collect()
}

fn parse_weight(path: &str, data: &str) -> Result<usize, RegistryError> {
    let malformed = |reason: String| RegistryError::MalformedData {
        path: path.to_string(),
        reason,
    };
    let value: Value = serde_json::from_str(data).map_err(|err| malformed(err.to_string()))?;
    let weight = match value.get("weight") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match weight {
        Some(weight) if (1..=u64::from(MAX_WEIGHT)).contains(&weight) => Ok(weight as usize),
        _ => Err(malformed(format!("invalid weight in `{data}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_weight("/p", r#"{"weight": 2}"#).unwrap(), 2);
        assert_eq!(parse_weight("/p", r#"{"weight": "3"}"#).unwrap(), 3);
        assert!(parse_weight("/p", r#"{"weight": 0}"#).is_err());
        assert_eq!(parse_weight("/p", r#"{"weight": 65535}"#).unwrap(), 65535);
        assert!(parse_weight("/p", r#"{"weight": 65536}"#).is_err());
        assert!(parse_weight("/p", r#"{"weight": 4000000000}"#).is_err());
        assert!(parse_weight("/p", r#"{"weight": "4000000000"}"#).is_err());
        assert!(parse_weight("/p", r#"{"weight": "x"}"#).is_err());
        assert!(parse_weight("/p", r#"{}"#).is_err());
        assert!(parse_weight("/p", "not json").is_err());
    }

    #[test]
    fn expands_by_weight() {
        let providers = vec![
            CachedProvider {
                address: "A".to_string(),
                weight: 2,
            },
            CachedProvider {
                address: "B".to_string(),
                weight: 1,
            },
        ];
        assert_eq!(expand(&providers), vec!["A", "A", "B"]);
    }
}
