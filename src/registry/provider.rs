use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;
use tracing::info;

use super::{ensure_root, providers_path, service_key, Coordinator, ROOT_PATH};
use crate::{
    error::RegistryError,
    server::{RpcServer, Service},
};

/// What a provider publishes about one exported service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    /// The service name.
    pub interface: String,
    /// The published version.
    pub version: String,
    /// The `host:port` clients connect to.
    pub address: String,
    /// Relative share of calls this provider should receive, at least 1.
    pub weight: u16,
    /// `method@types` signatures of the service.
    pub methods: Vec<String>,
}

impl ProviderConfig {
    /// Creates a config with weight 1 and no methods.
    pub fn new(
        interface: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        ProviderConfig {
            interface: interface.into(),
            version: version.into(),
            address: address.into(),
            weight: 1,
            methods: Vec::new(),
        }
    }

    /// Sets the weight.
    pub fn weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the method signatures.
    pub fn methods(mut self, methods: Vec<String>) -> Self {
        self.methods = methods;
        self
    }
}

#[derive(Serialize)]
struct Instance {
    weight: u16,
}

/// Publishes exported services to the registry.
pub struct RegistryProvider {
    coordinator: Arc<dyn Coordinator>,
}

impl RegistryProvider {
    /// Creates a provider, creating the registry root if it is missing.
    pub async fn new(coordinator: Arc<dyn Coordinator>) -> Result<Self, RegistryError> {
        ensure_root(coordinator.as_ref()).await?;
        Ok(RegistryProvider { coordinator })
    }

    /// Publishes a provider instance.
    ///
    /// The service node and its providers node are created on first registration, with the
    /// service node holding a JSON map of method signatures. The instance itself is an ephemeral
    /// node named after the provider's address, holding `{"weight": N}`. A weight of 0 is
    /// rejected before anything is written.
    pub async fn register(&self, provider: &ProviderConfig) -> Result<(), RegistryError> {
        check_weight(provider)?;
        let key = service_key(&provider.interface, &provider.version);
        let service_path = format!("{ROOT_PATH}/{key}");
        let providers = providers_path(&provider.interface, &provider.version);

        if !self.coordinator.check_exists(&service_path).await? {
            let methods: BTreeMap<&str, &str> = provider
                .methods
                .iter()
                .map(|method| (method.as_str(), method.as_str()))
                .collect();
            let methods = serde_json::to_string(&methods)?;
            create_if_missing(self.coordinator.add_persistent_node(&service_path, &methods).await)?;
            create_if_missing(self.coordinator.add_persistent_node(&providers, "").await)?;
        }

        let instance_path = format!("{providers}/{}", provider.address);
        let instance = serde_json::to_string(&Instance {
            weight: provider.weight,
        })?;
        self.coordinator
            .add_ephemeral_node(&instance_path, &instance)
            .await?;
        info!(
            service = %key,
            address = %provider.address,
            weight = provider.weight,
            "registered provider"
        );
        Ok(())
    }

    /// Exports `service` on `server` and publishes it under `version` at the server's address.
    pub async fn export(
        &self,
        server: &RpcServer,
        service: impl Service,
        version: &str,
        weight: u16,
    ) -> Result<(), RegistryError> {
        let config = ProviderConfig::new(
            service.name(),
            version,
            server.local_addr().to_string(),
        )
        .weight(weight)
        .methods(service.methods());
        check_weight(&config)?;
        server.register(service);
        self.register(&config).await
    }
}

impl fmt::Debug for RegistryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryProvider").finish_non_exhaustive()
    }
}

fn check_weight(provider: &ProviderConfig) -> Result<(), RegistryError> {
    if provider.weight == 0 {
        return Err(RegistryError::MalformedData {
            path: format!(
                "{}/{}",
                providers_path(&provider.interface, &provider.version),
                provider.address
            ),
            reason: "provider weight must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn create_if_missing(result: Result<(), RegistryError>) -> Result<(), RegistryError> {
    match result {
        Ok(()) | Err(RegistryError::NodeExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryCoordinator, ROOT_VALUE};

    #[tokio::test]
    async fn writes_the_registry_tree() {
        let coordinator = MemoryCoordinator::new();
        let provider = RegistryProvider::new(Arc::new(coordinator.clone()))
            .await
            .unwrap();

        let config = ProviderConfig::new("HelloService", "1.0.0", "127.0.0.1:8765")
            .weight(2)
            .methods(vec!["hello@string".to_string(), "hello@User".to_string()]);
        provider.register(&config).await.unwrap();

        assert_eq!(coordinator.get_data(ROOT_PATH).unwrap(), ROOT_VALUE);
        assert_eq!(
            coordinator
                .get_data("/rapid-rpc/HelloService:1.0.0")
                .unwrap(),
            r#"{"hello@User":"hello@User","hello@string":"hello@string"}"#
        );
        assert_eq!(
            coordinator
                .get_data("/rapid-rpc/HelloService:1.0.0/providers")
                .unwrap(),
            ""
        );
        assert_eq!(
            coordinator
                .get_data("/rapid-rpc/HelloService:1.0.0/providers/127.0.0.1:8765")
                .unwrap(),
            r#"{"weight":2}"#
        );
    }

    #[tokio::test]
    async fn second_provider_reuses_service_node() {
        let coordinator = MemoryCoordinator::new();
        let provider = RegistryProvider::new(Arc::new(coordinator.clone()))
            .await
            .unwrap();

        let first = ProviderConfig::new("HelloService", "1.0.0", "127.0.0.1:8765");
        let second = ProviderConfig::new("HelloService", "1.0.0", "127.0.0.1:8766");
        provider.register(&first).await.unwrap();
        provider.register(&second).await.unwrap();

        assert_eq!(
            coordinator.children("/rapid-rpc/HelloService:1.0.0/providers"),
            vec![
                "/rapid-rpc/HelloService:1.0.0/providers/127.0.0.1:8765".to_string(),
                "/rapid-rpc/HelloService:1.0.0/providers/127.0.0.1:8766".to_string(),
            ]
        );
        assert!(matches!(
            provider.register(&first).await,
            Err(RegistryError::NodeExists(_))
        ));
    }

    #[tokio::test]
    async fn zero_weight_is_rejected() {
        let coordinator = MemoryCoordinator::new();
        let provider = RegistryProvider::new(Arc::new(coordinator.clone()))
            .await
            .unwrap();

        let config = ProviderConfig::new("HelloService", "1.0.0", "127.0.0.1:8765").weight(0);
        match provider.register(&config).await {
            Err(RegistryError::MalformedData { path, .. }) => {
                assert_eq!(path, "/rapid-rpc/HelloService:1.0.0/providers/127.0.0.1:8765");
            }
            other => panic!("expected malformed data, got {other:?}"),
        }
        assert!(coordinator
            .get_data("/rapid-rpc/HelloService:1.0.0")
            .is_none());
    }
}
