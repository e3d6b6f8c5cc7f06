use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use dashmap::DashMap;
use tokio::{
    net::TcpStream,
    sync::Notify,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use crate::{config::ClientConfig, error::RpcError, pool::WorkerPool};

/// The connection state of a known peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Not connected; a reconnect is scheduled.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and available for selection.
    Connected,
}

struct PeerEntry {
    epoch: u64,
    weight: usize,
    state: PeerState,
    handler: Option<Arc<ConnectionHandler>>,
    retry: Option<JoinHandle<()>>,
}

/// Maintains one connection per server address and selects among them round-robin.
///
/// The manager is given the full list of server addresses whenever it changes. New addresses are
/// connected in the background, addresses no longer listed are closed, and connections that fail
/// or close are retried after a fixed backoff for as long as their address stays listed.
///
/// Callers pick a connection with [`choose_handler`](ConnectionManager::choose_handler), which
/// waits a bounded time for one to become available.
///
/// Background tasks only hold weak references to the manager. Dropping the last handle closes
/// every connection and cancels pending reconnects, as [`stop`](ConnectionManager::stop) does.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ClientConfig,
    peers: DashMap<SocketAddr, PeerEntry>,
    handlers: RwLock<Arc<Vec<Arc<ConnectionHandler>>>>,
    next_handler: AtomicUsize,
    next_epoch: AtomicU64,
    connected: Notify,
    running: AtomicBool,
    connector: WorkerPool,
    callbacks: WorkerPool,
}

impl ConnectionManager {
    /// Creates a manager with no peers.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let connector = WorkerPool::new("connect", config.connect_workers, config.queue_capacity);
        let callbacks =
            WorkerPool::new("callbacks", config.callback_workers, config.queue_capacity);
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                config,
                peers: DashMap::new(),
                handlers: RwLock::new(Arc::new(Vec::new())),
                next_handler: AtomicUsize::new(0),
                next_epoch: AtomicU64::new(0),
                connected: Notify::new(),
                running: AtomicBool::new(true),
                connector,
                callbacks,
            }),
        }
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Replaces the set of server addresses.
    ///
    /// Each address is an `ip:port` string; host names are not resolved. Addresses listed more
    /// than once are connected once and selected proportionally more often. Addresses that fail
    /// to parse are skipped. An empty list closes every connection.
    pub fn update_connected_server<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.is_running() {
            warn!("ignoring server update after stop");
            return;
        }

        let mut desired: HashMap<SocketAddr, usize> = HashMap::new();
        for address in addresses {
            let address = address.as_ref().trim();
            match resolve(address) {
                Some(addr) => *desired.entry(addr).or_default() += 1,
                None => warn!(address, "skipping malformed server address"),
            }
        }

        if desired.is_empty() {
            error!("no available server address, closing all connections");
            self.clear();
            return;
        }

        let mut reweighted = false;
        for (addr, weight) in &desired {
            let mut inserted = None;
            self.inner
                .peers
                .entry(*addr)
                .and_modify(|entry| {
                    if entry.weight != *weight {
                        entry.weight = *weight;
                        reweighted = true;
                    }
                })
                .or_insert_with(|| {
                    let epoch = self.next_epoch();
                    inserted = Some(epoch);
                    PeerEntry {
                        epoch,
                        weight: *weight,
                        state: PeerState::Connecting,
                        handler: None,
                        retry: None,
                    }
                });
            if let Some(epoch) = inserted {
                info!(%addr, weight, "connecting to new server");
                self.connect_async(*addr, epoch);
            }
        }

        let stale: Vec<SocketAddr> = self
            .inner
            .peers
            .iter()
            .filter(|entry| !desired.contains_key(entry.key()))
            .map(|entry| *entry.key())
            .collect();
        for addr in stale {
            info!(%addr, "removing server no longer listed");
            self.evict(addr);
        }

        if reweighted {
            self.rebuild_handlers();
        }
    }

    /// Closes the connection to `addr`, if any, and connects to it again.
    pub fn reconnect(&self, addr: SocketAddr) {
        if !self.is_running() {
            return;
        }
        let epoch = self.next_epoch();
        let old = {
            let mut entry = self.inner.peers.entry(addr).or_insert_with(|| PeerEntry {
                epoch,
                weight: 1,
                state: PeerState::Connecting,
                handler: None,
                retry: None,
            });
            entry.epoch = epoch;
            entry.state = PeerState::Connecting;
            if let Some(retry) = entry.retry.take() {
                retry.abort();
            }
            entry.handler.take()
        };
        if let Some(handler) = old {
            self.rebuild_handlers();
            handler.close();
        }
        info!(%addr, "reconnecting");
        self.connect_async(addr, epoch);
    }

    /// Returns a connected handler, waiting for one if none is available.
    ///
    /// Handlers are selected round-robin over a snapshot of the connected set. When the set is
    /// empty the caller waits until a connection is established, failing with
    /// [`RpcError::NoPeerAvailable`] once the configured choose timeout has elapsed, or with
    /// [`RpcError::Stopped`] if the manager is stopped while waiting.
    pub async fn choose_handler(&self) -> Result<Arc<ConnectionHandler>, RpcError> {
        let timeout = self.inner.config.choose_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                return Err(RpcError::Stopped);
            }
            let handlers = self.handlers();
            if !handlers.is_empty() {
                let idx = self.inner.next_handler.fetch_add(1, Ordering::Relaxed) % handlers.len();
                return Ok(handlers[idx].clone());
            }

            debug!("waiting for an available connection");
            if time::timeout_at(deadline, notified).await.is_err() {
                warn!(waited_ms = timeout.as_millis() as u64, "no connection became available");
                return Err(RpcError::NoPeerAvailable { waited: timeout });
            }
        }
    }

    /// Returns a snapshot of the selection list.
    ///
    /// A peer with weight `n` appears `n` times.
    pub fn handlers(&self) -> Arc<Vec<Arc<ConnectionHandler>>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.inner
            .peers
            .iter()
            .filter(|entry| entry.state == PeerState::Connected)
            .count()
    }

    /// Returns every known peer and its state.
    pub fn peers(&self) -> Vec<(SocketAddr, PeerState)> {
        self.inner
            .peers
            .iter()
            .map(|entry| (*entry.key(), entry.state))
            .collect()
    }

    /// Returns `false` once [`stop`](ConnectionManager::stop) has been called.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Closes every connection, cancels pending reconnects and wakes all waiting callers.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping connection manager");
        self.clear();
        self.inner.connected.notify_waiters();
        self.inner.connector.shutdown();
        self.inner.callbacks.shutdown();
    }

    fn next_epoch(&self) -> u64 {
        self.inner.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<ManagerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| ConnectionManager { inner })
    }

    fn connect_async(&self, addr: SocketAddr, epoch: u64) {
        let manager = self.downgrade();
        let connect_timeout = self.inner.config.connect_timeout;
        if let Err(err) = self.inner.connector.try_submit(async move {
            let connected = time::timeout(connect_timeout, TcpStream::connect(addr)).await;
            if let Some(manager) = ConnectionManager::upgrade(&manager) {
                manager.connected(addr, epoch, connected);
            }
        }) {
            warn!(%addr, %err, "failed to schedule connection attempt");
            self.disconnected(addr, epoch, None);
        }
    }

    fn connected(
        &self,
        addr: SocketAddr,
        epoch: u64,
        connected: Result<io::Result<TcpStream>, time::error::Elapsed>,
    ) {
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(%addr, %err, "failed to connect");
                self.disconnected(addr, epoch, None);
                return;
            }
            Err(_) => {
                warn!(%addr, "timed out connecting");
                self.disconnected(addr, epoch, None);
                return;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%addr, %err, "failed to set nodelay");
        }

        let handler = match ConnectionHandler::spawn(
            stream,
            &self.inner.config,
            self.inner.callbacks.clone(),
        ) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(%addr, %err, "connection dropped before activation");
                self.disconnected(addr, epoch, None);
                return;
            }
        };

        if !self.activate(addr, epoch, &handler) {
            debug!(%addr, "discarding connection for a removed peer");
            handler.close();
            return;
        }
        info!(%addr, remote_addr = %handler.remote_addr(), "connected to server");

        let manager = self.downgrade();
        tokio::spawn(async move {
            handler.closed().await;
            if let Some(manager) = ConnectionManager::upgrade(&manager) {
                manager.disconnected(addr, epoch, Some(&handler));
            }
        });
    }

    fn activate(&self, addr: SocketAddr, epoch: u64, handler: &Arc<ConnectionHandler>) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            return false;
        }
        match self.inner.peers.get_mut(&addr) {
            Some(mut entry) if entry.epoch == epoch => {
                entry.state = PeerState::Connected;
                entry.handler = Some(handler.clone());
            }
            _ => return false,
        }
        *handlers = self.selection_list();
        drop(handlers);
        self.inner.connected.notify_waiters();
        true
    }

    fn disconnected(&self, addr: SocketAddr, epoch: u64, handler: Option<&Arc<ConnectionHandler>>) {
        let current = match self.inner.peers.get_mut(&addr) {
            Some(mut entry) if entry.epoch == epoch => {
                entry.state = PeerState::Disconnected;
                entry.handler = None;
                true
            }
            _ => false,
        };
        if handler.is_some() {
            info!(%addr, "connection closed");
            self.rebuild_handlers();
        }
        if current && self.is_running() {
            self.schedule_reconnect(addr, epoch);
        }
    }

    fn schedule_reconnect(&self, addr: SocketAddr, epoch: u64) {
        let manager = self.downgrade();
        let interval = self.inner.config.reconnect_interval;
        let retry = tokio::spawn(async move {
            time::sleep(interval).await;
            if let Some(manager) = ConnectionManager::upgrade(&manager) {
                manager.retry(addr, epoch);
            }
        });
        match self.inner.peers.get_mut(&addr) {
            Some(mut entry) if entry.epoch == epoch => {
                if let Some(previous) = entry.retry.replace(retry) {
                    previous.abort();
                }
            }
            _ => retry.abort(),
        }
    }

    fn retry(&self, addr: SocketAddr, epoch: u64) {
        if !self.is_running() {
            return;
        }
        match self.inner.peers.get_mut(&addr) {
            Some(mut entry) if entry.epoch == epoch && entry.state == PeerState::Disconnected => {
                entry.state = PeerState::Connecting;
                entry.retry = None;
            }
            _ => return,
        }
        info!(%addr, "reconnecting");
        self.connect_async(addr, epoch);
    }

    fn evict(&self, addr: SocketAddr) {
        let Some((_, entry)) = self.inner.peers.remove(&addr) else {
            return;
        };
        if let Some(retry) = entry.retry {
            retry.abort();
        }
        if let Some(handler) = entry.handler {
            self.rebuild_handlers();
            handler.close();
        }
    }

    fn clear(&self) {
        let addrs: Vec<SocketAddr> = self.inner.peers.iter().map(|entry| *entry.key()).collect();
        for addr in addrs {
            self.evict(addr);
        }
        self.rebuild_handlers();
    }

    fn rebuild_handlers(&self) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *handlers = if self.is_running() {
            self.selection_list()
        } else {
            Arc::new(Vec::new())
        };
    }

    fn selection_list(&self) -> Arc<Vec<Arc<ConnectionHandler>>> {
        let mut peers: Vec<(SocketAddr, usize, Arc<ConnectionHandler>)> = self
            .inner
            .peers
            .iter()
            .filter_map(|entry| {
                let handler = entry.handler.as_ref()?;
                (entry.state == PeerState::Connected).then(|| {
                    (*entry.key(), entry.weight, handler.clone())
                })
            })
            .collect();
        peers.sort_by_key(|(addr, _, _)| *addr);
        Arc::new(
            peers
                .into_iter()
                .flat_map(|(_, weight, handler)| itertools::repeat_n(handler, weight))
                .collect(),
        )
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for (addr, entry) in std::mem::take(&mut self.peers) {
            if let Some(retry) = entry.retry {
                retry.abort();
            }
            if let Some(handler) = entry.handler {
                debug!(%addr, "closing connection of dropped manager");
                handler.close();
            }
        }
        self.connector.shutdown();
        self.callbacks.shutdown();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peers", &self.peers())
            .field("running", &self.is_running())
            .finish()
    }
}

fn resolve(address: &str) -> Option<SocketAddr> {
    address.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Accepts connections and keeps them open until the listener task is dropped.
    fn accept_forever(listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut streams = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                streams.push(stream);
            }
        })
    }

    async fn wait_for_connected(manager: &ConnectionManager, n: usize) {
        time::timeout(Duration::from_secs(5), async {
            while manager.connected_count() != n {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn resolves_addresses() {
        assert_eq!(
            resolve("127.0.0.1:8765"),
            Some("127.0.0.1:8765".parse().unwrap())
        );
        assert_eq!(
            resolve("[::1]:8765"),
            Some("[::1]:8765".parse().unwrap())
        );
        assert_eq!(resolve("localhost:8765"), None);
        assert_eq!(resolve("not an address"), None);
        assert_eq!(resolve("127.0.0.1"), None);
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let mut addrs = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..3 {
            let (listener, addr) = listener().await;
            addrs.push(addr.to_string());
            servers.push(accept_forever(listener));
        }

        let manager = ConnectionManager::new(ClientConfig::default());
        manager.update_connected_server(&addrs);
        wait_for_connected(&manager, 3).await;

        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for _ in 0..30 {
            let handler = manager.choose_handler().await.unwrap();
            *counts.entry(handler.remote_addr()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == 10));

        manager.stop();
    }

    #[tokio::test]
    async fn duplicate_addresses_are_weighted() {
        let (a, addr_a) = listener().await;
        let (b, addr_b) = listener().await;
        let _servers = (accept_forever(a), accept_forever(b));

        let manager = ConnectionManager::new(ClientConfig::default());
        let a = addr_a.to_string();
        let b = addr_b.to_string();
        manager.update_connected_server([&a, &a, &b]);
        wait_for_connected(&manager, 2).await;

        assert_eq!(manager.peers().len(), 2);
        let handlers = manager.handlers();
        assert_eq!(handlers.len(), 3);
        assert_eq!(
            handlers.iter().filter(|h| h.remote_addr() == addr_a).count(),
            2
        );

        manager.stop();
    }

    #[tokio::test]
    async fn update_evicts_unlisted_peers() {
        let (a, addr_a) = listener().await;
        let (b, addr_b) = listener().await;
        let _servers = (accept_forever(a), accept_forever(b));

        let manager = ConnectionManager::new(ClientConfig::default());
        manager.update_connected_server([addr_a.to_string(), addr_b.to_string()]);
        wait_for_connected(&manager, 2).await;

        manager.update_connected_server([addr_b.to_string()]);
        let peers = manager.peers();
        assert_eq!(peers, vec![(addr_b, PeerState::Connected)]);
        let handlers = manager.handlers();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].remote_addr(), addr_b);

        manager.update_connected_server(Vec::<String>::new());
        assert!(manager.peers().is_empty());
        assert!(manager.handlers().is_empty());

        manager.stop();
    }

    #[tokio::test]
    async fn malformed_addresses_are_skipped() {
        let (a, addr_a) = listener().await;
        let _server = accept_forever(a);

        let manager = ConnectionManager::new(ClientConfig::default());
        manager.update_connected_server(["garbage", addr_a.to_string().as_str()]);
        wait_for_connected(&manager, 1).await;
        assert_eq!(manager.peers(), vec![(addr_a, PeerState::Connected)]);

        manager.stop();
    }

    #[tokio::test]
    async fn choose_times_out_without_peers() {
        let config = ClientConfig::default().choose_timeout(Duration::from_millis(100));
        let manager = ConnectionManager::new(config);

        let started = Instant::now();
        let err = manager.choose_handler().await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(matches!(err, RpcError::NoPeerAvailable { .. }));
    }

    #[tokio::test]
    async fn stop_unblocks_waiting_callers() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.choose_handler().await })
        };
        time::sleep(Duration::from_millis(50)).await;
        manager.stop();

        let result = time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RpcError::Stopped)));
        assert!(matches!(
            manager.choose_handler().await,
            Err(RpcError::Stopped)
        ));
    }

    #[tokio::test]
    async fn waiting_caller_gets_late_connection() {
        let (listener, addr) = listener().await;
        let manager = ConnectionManager::new(ClientConfig::default());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.choose_handler().await })
        };
        time::sleep(Duration::from_millis(50)).await;

        let _server = accept_forever(listener);
        manager.update_connected_server([addr.to_string()]);

        let handler = time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handler.remote_addr(), addr);

        manager.stop();
    }

    #[tokio::test]
    async fn reconnects_after_connection_drop() {
        let (listener, addr) = listener().await;
        let config = ClientConfig::default().reconnect_interval(Duration::from_millis(100));
        let manager = ConnectionManager::new(config);

        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        let _server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (second, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            let _hold = second;
            std::future::pending::<()>().await;
        });
        manager.update_connected_server([addr.to_string()]);

        time::timeout(Duration::from_secs(5), accepted_rx)
            .await
            .unwrap()
            .unwrap();
        wait_for_connected(&manager, 1).await;
        assert_eq!(manager.handlers().len(), 1);

        manager.stop();
        assert!(manager.handlers().is_empty());
        assert!(manager.peers().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replaces_the_handler() {
        let (listener, addr) = listener().await;
        let _server = accept_forever(listener);
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.update_connected_server([addr.to_string()]);
        wait_for_connected(&manager, 1).await;
        let old = manager.handlers()[0].clone();

        manager.reconnect(addr);
        time::timeout(Duration::from_secs(5), old.closed())
            .await
            .unwrap();
        assert!(old.is_closed());

        time::timeout(Duration::from_secs(5), async {
            loop {
                let handlers = manager.handlers();
                if handlers.len() == 1 && !Arc::ptr_eq(&handlers[0], &old) {
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.peers(), vec![(addr, PeerState::Connected)]);
        let chosen = manager.choose_handler().await.unwrap();
        assert!(!Arc::ptr_eq(&chosen, &old));
        assert!(!chosen.is_closed());

        manager.stop();
    }

    #[tokio::test]
    async fn dropping_the_last_handle_closes_connections() {
        let (listener, addr) = listener().await;
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.update_connected_server([addr.to_string()]);
        let (mut accepted, _) = time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_for_connected(&manager, 1).await;

        drop(manager);
        let mut buf = [0u8; 16];
        let read = time::timeout(Duration::from_secs(2), accepted.read(&mut buf))
            .await
            .expect("connection still open after the manager was dropped")
            .unwrap();
        assert_eq!(read, 0);
    }
}
