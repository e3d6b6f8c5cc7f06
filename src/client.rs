//! The client side of an RPC connection.
//!
//! An [`RpcClient`] owns a [`ConnectionManager`] holding one connection per server address.
//! Remote services are reached either through stubs generated by the
//! [`service`](crate::service) macro, which wait for results, or through an [`AsyncProxy`],
//! which returns an [`RpcFuture`](crate::future::RpcFuture) per call.
//!
//! # Example
//!
//! ```no_run
//! use courier::{client::RpcClient, config::ClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), courier::error::RpcError> {
//! let client = RpcClient::connect("127.0.0.1:8765", ClientConfig::default());
//! let proxy = client.proxy("HelloService");
//! let reply = proxy.call::<String, _>("hello", ("li4",)).await?.await?;
//! println!("{reply}");
//! client.stop();
//! # Ok(())
//! # }
//! ```

mod handler;
mod manager;
mod proxy;

use std::sync::Arc;

pub use handler::ConnectionHandler;
pub use manager::{ConnectionManager, PeerState};
pub use proxy::{AsyncProxy, ServiceClient};
use tracing::info;

use crate::config::ClientConfig;

/// Entry point for calling remote services.
///
/// Cloning an `RpcClient` is cheap; clones share the same connections.
#[derive(Clone, Debug)]
pub struct RpcClient {
    manager: ConnectionManager,
}

impl RpcClient {
    /// Creates a client with no servers.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        RpcClient {
            manager: ConnectionManager::new(config),
        }
    }

    /// Creates a client connected to a comma-separated list of `host:port` addresses.
    ///
    /// Connections are established in the background.
    pub fn connect(addresses: &str, config: ClientConfig) -> Self {
        let client = RpcClient::new(config);
        client.update_servers(addresses.split(',').filter(|addr| !addr.trim().is_empty()));
        client
    }

    /// Replaces the set of server addresses.
    ///
    /// See [`ConnectionManager::update_connected_server`].
    pub fn update_servers<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.manager.update_connected_server(addresses);
    }

    /// Returns a handle for calling methods of `service`.
    pub fn service(&self, service: &str) -> ServiceClient {
        ServiceClient::new(self.manager.clone(), Arc::from(service))
    }

    /// Returns a proxy for calling methods of `service` asynchronously.
    pub fn proxy(&self, service: &str) -> AsyncProxy {
        AsyncProxy::new(self.service(service))
    }

    /// Returns the underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Closes every connection and stops background work.
    ///
    /// Calls waiting for a connection fail with
    /// [`RpcError::Stopped`](crate::error::RpcError::Stopped).
    pub fn stop(&self) {
        info!("stopping client");
        self.manager.stop();
    }
}
