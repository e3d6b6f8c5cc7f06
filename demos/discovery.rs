use std::{sync::Arc, time::Duration};

use courier::{
    config::{ClientConfig, ServerConfig},
    registry::{MemoryCoordinator, RegistryConsumer, RegistryProvider},
    server::RpcServer,
    service,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[service]
pub trait HelloService {
    async fn hello(&self, name: String) -> String;
}

struct Greeter {
    port: u16,
}

impl HelloService for Greeter {
    async fn hello(&self, name: String) -> String {
        format!("hello! {name} (from :{})", self.port)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info".parse::<EnvFilter>()?)
        .without_time()
        .with_target(false)
        .init();

    let coordinator = MemoryCoordinator::new();

    // Two providers of the same service, the first taking twice the traffic.
    let mut servers = Vec::new();
    for weight in [2, 1] {
        let server = RpcServer::bind("127.0.0.1:0", ServerConfig::default()).await?;
        let provider = RegistryProvider::new(Arc::new(coordinator.session())).await?;
        let greeter = Greeter {
            port: server.local_addr().port(),
        };
        provider
            .export(&server, HelloServiceServer::new(greeter), "1.0.0", weight)
            .await?;
        servers.push(server);
    }

    let consumer =
        RegistryConsumer::start(Arc::new(coordinator.session()), ClientConfig::default()).await?;
    while consumer.addresses("HelloService", "1.0.0").len() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!(
        "servers: {:?}",
        consumer.addresses("HelloService", "1.0.0")
    );

    let Some(client) = consumer.consumer("HelloService", "1.0.0") else {
        return Err("no client for HelloService:1.0.0".into());
    };
    let hello = HelloServiceClient::new(&client);
    for i in 0..6 {
        info!("--> {}", hello.hello(format!("caller-{i}")).await?);
    }

    consumer.stop();
    for server in &servers {
        server.shutdown();
    }

    Ok(())
}
