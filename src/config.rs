//! Client and server configuration.

use std::time::Duration;

/// Default time a synchronous call waits for its response.
pub const DEFAULT_CALL_TIMEOUT_MILLIS: u64 = 3000;

/// Default timeout for establishing a TCP connection to a peer.
pub const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 3000;

/// Default fixed backoff between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 3;

/// Default time a caller waits for a connected peer before failing.
pub const DEFAULT_CHOOSE_TIMEOUT_MILLIS: u64 = 6000;

/// Default number of workers in each bounded pool.
pub const DEFAULT_WORKERS: usize = 16;

/// Default capacity of each bounded pool's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 65536;

/// Default capacity of a connection's outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default listen backlog for the server socket.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Configuration for an [`RpcClient`](crate::client::RpcClient) and its connection manager.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long a synchronous call waits for its response.
    pub call_timeout: Duration,
    /// Timeout for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Fixed delay before reconnecting to a peer whose connection failed or closed.
    pub reconnect_interval: Duration,
    /// How long `choose_handler` waits for a connected peer.
    pub choose_timeout: Duration,
    /// Number of workers making connection attempts.
    pub connect_workers: usize,
    /// Number of workers running completion callbacks.
    pub callback_workers: usize,
    /// Queue capacity of the connect and callback pools.
    pub queue_capacity: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,
    /// Maximum payload size of a frame, in bytes.
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MILLIS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MILLIS),
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS),
            choose_timeout: Duration::from_millis(DEFAULT_CHOOSE_TIMEOUT_MILLIS),
            connect_workers: DEFAULT_WORKERS,
            callback_workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_len: crate::wire::MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    /// Sets the synchronous call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the reconnect backoff.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets how long callers wait for a connected peer.
    pub fn choose_timeout(mut self, timeout: Duration) -> Self {
        self.choose_timeout = timeout;
        self
    }
}

/// Configuration for an [`RpcServer`](crate::server::RpcServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of workers executing service methods.
    pub workers: usize,
    /// Capacity of the worker queue; requests beyond it are rejected.
    pub queue_capacity: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,
    /// Maximum payload size of a frame, in bytes.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backlog: DEFAULT_BACKLOG,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_len: crate::wire::MAX_FRAME_LEN,
        }
    }
}
