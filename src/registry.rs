//! Service discovery over a coordination service.
//!
//! Providers publish themselves under a fixed tree:
//!
//! ```text
//! /rapid-rpc                               "rapid-rpc-1.0.0"
//!     /HelloService:1.0.0                  {"hello@string": "hello@string", ...}
//!         /providers                       ""
//!             /127.0.0.1:8765              {"weight": 1}    (ephemeral)
//!             /127.0.0.1:8766              {"weight": 2}    (ephemeral)
//! ```
//!
//! A [`RegistryProvider`] writes this tree for each exported service. A [`RegistryConsumer`]
//! watches it and keeps one [`RpcClient`](crate::client::RpcClient) per `interface:version`,
//! updating its server list as providers appear.
//!
//! The coordination service itself sits behind the [`Coordinator`] trait. [`MemoryCoordinator`]
//! is an in-process implementation.

mod consumer;
mod coordinator;
mod provider;

pub use consumer::{CachedProvider, RegistryConsumer};
pub use coordinator::{ChangeType, ChangedEvent, Coordinator, MemoryCoordinator};
pub use provider::{ProviderConfig, RegistryProvider};

use crate::error::RegistryError;

/// Path of the registry root node.
pub const ROOT_PATH: &str = "/rapid-rpc";

/// Value stored at the registry root.
pub const ROOT_VALUE: &str = "rapid-rpc-1.0.0";

/// Name of the node holding a service's provider addresses.
pub const PROVIDERS_NODE: &str = "providers";

/// Largest provider weight accepted in the registry.
pub const MAX_WEIGHT: u16 = u16::MAX;

/// Returns the `interface:version` key identifying a published service.
pub fn service_key(interface: &str, version: &str) -> String {
    format!("{interface}:{version}")
}

/// Returns the path of a service's providers node.
pub fn providers_path(interface: &str, version: &str) -> String {
    format!(
        "{ROOT_PATH}/{}/{PROVIDERS_NODE}",
        service_key(interface, version)
    )
}

async fn ensure_root(coordinator: &dyn Coordinator) -> Result<(), RegistryError> {
    if coordinator.check_exists(ROOT_PATH).await? {
        return Ok(());
    }
    match coordinator.add_persistent_node(ROOT_PATH, ROOT_VALUE).await {
        Ok(()) | Err(RegistryError::NodeExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}
