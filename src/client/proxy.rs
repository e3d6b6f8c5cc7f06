use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;

use super::ConnectionManager;
use crate::{
    codec::{Args, Decode},
    error::RpcError,
    future::RpcFuture,
    wire::Request,
};

/// A handle for calling the methods of one remote service.
///
/// Calls made through [`invoke`](ServiceClient::invoke) wait for the response, bounded by the
/// client's call timeout. Stubs generated by the [`service`](crate::service) macro wrap a
/// `ServiceClient` and pass each method's declared parameter types.
#[derive(Clone)]
pub struct ServiceClient {
    manager: ConnectionManager,
    service: Arc<str>,
    timeout: Duration,
}

impl ServiceClient {
    pub(crate) fn new(manager: ConnectionManager, service: Arc<str>) -> Self {
        let timeout = manager.config().call_timeout;
        ServiceClient {
            manager,
            service,
            timeout,
        }
    }

    /// Returns the remote service name.
    pub fn name(&self) -> &str {
        &self.service
    }

    /// Returns the timeout applied to each call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Overrides the call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calls `method` and waits for its result.
    ///
    /// `param_types` are the canonical descriptors of the method's declared parameter types, and
    /// `params` the separately encoded arguments. Fails with [`RpcError::Timeout`] if no response
    /// arrives in time.
    pub async fn invoke<R>(
        &self,
        method: &str,
        param_types: Vec<String>,
        params: Vec<Bytes>,
    ) -> Result<R, RpcError>
    where
        R: Decode + 'static,
    {
        let future = self
            .send::<R>(Request::new(&*self.service, method, param_types, params))
            .await?;
        future.get_timeout(self.timeout).await
    }

    /// Sends a request on a connection chosen by the manager and returns its pending result.
    pub async fn send<R>(&self, request: Request) -> Result<RpcFuture<R>, RpcError> {
        let handler = self.manager.choose_handler().await?;
        handler.send_request(request)
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Calls methods of a remote service by name, returning pending results.
///
/// Parameter types are taken from the runtime arguments. Results are delivered through the
/// returned [`RpcFuture`], which can be awaited or given callbacks.
///
/// # Example
///
/// ```no_run
/// # use courier::client::RpcClient;
/// # use courier::config::ClientConfig;
/// # #[tokio::main]
/// # async fn main() -> Result<(), courier::error::RpcError> {
/// let client = RpcClient::connect("127.0.0.1:8765", ClientConfig::default());
/// let proxy = client.proxy("HelloService");
/// let greeting = proxy.call::<String, _>("hello", ("li4",)).await?;
/// greeting.add_callback(|result| println!("{result:?}"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct AsyncProxy {
    client: ServiceClient,
}

impl AsyncProxy {
    pub(crate) fn new(client: ServiceClient) -> Self {
        AsyncProxy { client }
    }

    /// Returns the remote service name.
    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// Sends a call of `method` with `args` and returns its pending result.
    ///
    /// Returns once the request is queued on a connection; waiting for a connection is bounded
    /// by the client's choose timeout.
    pub async fn call<R, A>(&self, method: &str, args: A) -> Result<RpcFuture<R>, RpcError>
    where
        A: Args,
    {
        let (param_types, params) = args.into_params()?;
        self.client
            .send(Request::new(self.name(), method, param_types, params))
            .await
    }
}
