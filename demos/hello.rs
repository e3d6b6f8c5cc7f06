use std::time::Duration;

use courier::{
    client::RpcClient,
    config::{ClientConfig, ServerConfig},
    server::RpcServer,
    service,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    name: String,
}

#[service]
pub trait HelloService {
    async fn hello(&self, name: String) -> String;

    async fn hello_user(&self, user: User) -> String;
}

struct Greeter;

impl HelloService for Greeter {
    async fn hello(&self, name: String) -> String {
        format!("hello! {name}")
    }

    async fn hello_user(&self, user: User) -> String {
        format!("hello! {}", user.name)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info".parse::<EnvFilter>()?)
        .without_time()
        .with_target(false)
        .init();

    let server = RpcServer::bind("127.0.0.1:8765", ServerConfig::default()).await?;
    server.register(HelloServiceServer::new(Greeter));
    info!("listening on {}", server.local_addr());

    let client = RpcClient::connect("127.0.0.1:8765", ClientConfig::default());

    // Generated stub: waits for the result.
    let hello = HelloServiceClient::new(&client);
    let reply = hello.hello("zhang3".to_string()).await?;
    info!("--> {reply}");

    // Proxy: returns a future that can be awaited later or given a callback.
    let proxy = client.proxy("HelloService");
    let pending = proxy
        .call::<String, _>(
            "hello_user",
            (User {
                name: "li4".to_string(),
            },),
        )
        .await?;
    pending.add_callback(|result| match result {
        Ok(reply) => info!("--> callback: {reply}"),
        Err(err) => error!("call failed: {err}"),
    });
    let reply = pending.get_timeout(Duration::from_secs(3)).await?;
    info!("--> {reply}");

    client.stop();
    server.shutdown();
    server.wait().await;

    Ok(())
}
