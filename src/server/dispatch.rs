use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{error, trace};

use crate::{
    codec::{Encode, Params},
    error::ServiceError,
    pool::panic_message,
    wire::{Request, Response},
};

/// A service that can be exported by an [`RpcServer`](super::RpcServer).
///
/// Implementations are usually generated by the [`service`](crate::service) macro, or built by
/// hand with a [`MethodTable`].
pub trait Service: Send + Sync + 'static {
    /// The name clients use to address this service.
    fn name(&self) -> &str;

    /// Returns the `method@type1,type2` signatures this service accepts.
    fn methods(&self) -> Vec<String>;

    /// Invokes `method` with already encoded parameters.
    fn call(
        &self,
        method: &str,
        param_types: &[String],
        params: Vec<Bytes>,
    ) -> BoxFuture<'static, Result<Bytes, ServiceError>>;
}

/// Formats the lookup key of a method: its name, `@`, and comma-separated parameter types.
///
/// ```
/// use courier::server::method_signature;
///
/// assert_eq!(method_signature("hello", &["string".to_string()]), "hello@string");
/// assert_eq!(method_signature("ping", &[]), "ping@");
/// ```
pub fn method_signature(method: &str, param_types: &[String]) -> String {
    format!("{method}@{}", param_types.join(","))
}

type MethodFn =
    Box<dyn Fn(Vec<Bytes>) -> BoxFuture<'static, Result<Bytes, ServiceError>> + Send + Sync>;

/// A service built from a table of method closures, keyed by signature.
///
/// # Example
///
/// ```
/// use courier::{error::ServiceError, server::{MethodTable, Service}};
///
/// let service = MethodTable::new("HelloService")
///     .method("hello", |(name,): (String,)| async move {
///         Ok::<_, ServiceError>(format!("hello! {name}"))
///     });
/// assert_eq!(service.methods(), vec!["hello@string".to_string()]);
/// ```
pub struct MethodTable {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    /// Creates an empty table for the service `name`.
    pub fn new(name: impl Into<String>) -> Self {
        MethodTable {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds a method taking the parameter tuple `A`.
    ///
    /// A method with the same name and parameter types replaces the previous one.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: Params,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        let signature = method_signature(name, &A::descriptors());
        let method: MethodFn = Box::new(move |params| match A::from_params(params) {
            Ok(args) => {
                let fut = handler(args);
                async move { fut.await?.encode().map_err(ServiceError::Encode) }.boxed()
            }
            Err(err) => futures::future::ready(Err(ServiceError::BadArguments(err))).boxed(),
        });
        self.methods.insert(signature, method);
        self
    }
}

impl Service for MethodTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.methods.keys().cloned().collect();
        methods.sort();
        methods
    }

    fn call(
        &self,
        method: &str,
        param_types: &[String],
        params: Vec<Bytes>,
    ) -> BoxFuture<'static, Result<Bytes, ServiceError>> {
        let signature = method_signature(method, param_types);
        match self.methods.get(&signature) {
            Some(method) => method(params),
            None => futures::future::ready(Err(ServiceError::UnknownMethod {
                service: self.name.clone(),
                signature,
            }))
            .boxed(),
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("name", &self.name)
            .field("methods", &self.methods())
            .finish()
    }
}

/// The services exported by a server, keyed by name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Arc<dyn Service>>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Registers a service, replacing any service with the same name.
    pub fn insert(&self, service: Arc<dyn Service>) -> Option<Arc<dyn Service>> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.name().to_string(), service)
    }

    /// Removes the service registered under `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Returns the service registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the registered service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Returns the number of registered services.
    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no services are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes the target of `request` and builds its response.
    ///
    /// Every failure, including a panic in the method, is captured in the response.
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            id,
            service,
            method,
            param_types,
            params,
        } = request;
        trace!(request_id = %id, %service, %method, "handling request");

        let result = match self.get(&service) {
            Some(target) => {
                AssertUnwindSafe(async { target.call(&method, &param_types, params).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ServiceError::Panicked(panic_message(&*panic))))
            }
            None => Err(ServiceError::UnknownService(service.clone())),
        };

        match result {
            Ok(result) => Response::ok(id, result),
            Err(err) => {
                error!(request_id = %id, %service, %method, %err, "request failed");
                Response::err(id, err.into())
            }
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{Args, Decode},
        error::RemoteErrorKind,
    };

    fn hello_service() -> MethodTable {
        MethodTable::new("HelloService")
            .method("hello", |(name,): (String,)| async move {
                Ok::<_, ServiceError>(format!("hello! {name}"))
            })
            .method("add", |(a, b): (i32, i32)| async move {
                Ok::<_, ServiceError>(a + b)
            })
            .method("fail", |(): ()| async move {
                Err::<(), _>(ServiceError::handler("boom"))
            })
            .method("explode", |(): ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, ServiceError>(())
            })
    }

    fn request(method: &str, args: impl Args) -> Request {
        let (param_types, params) = args.into_params().unwrap();
        Request::new("HelloService", method, param_types, params)
    }

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.insert(Arc::new(hello_service()));
        registry
    }

    #[test]
    fn lists_method_signatures() {
        assert_eq!(
            hello_service().methods(),
            vec!["add@int,int", "explode@", "fail@", "hello@string"]
        );
    }

    #[tokio::test]
    async fn dispatches_by_signature() {
        let registry = registry();

        let response = registry.handle(request("hello", ("zhang3",))).await;
        let result = String::decode(&response.result.unwrap()).unwrap();
        assert_eq!(result, "hello! zhang3");

        let response = registry.handle(request("add", (2i32, 3i32))).await;
        assert_eq!(i32::decode(&response.result.unwrap()).unwrap(), 5);
    }

    #[tokio::test]
    async fn captures_failures_in_response() {
        let registry = registry();

        let response = registry.handle(request("hello", (1i64,))).await;
        assert_eq!(response.error.unwrap().kind, RemoteErrorKind::UnknownMethod);

        let mut wrong_service = request("hello", ("zhang3",));
        wrong_service.service = "Missing".to_string();
        let response = registry.handle(wrong_service).await;
        assert_eq!(response.error.unwrap().kind, RemoteErrorKind::UnknownService);

        let response = registry.handle(request("fail", ())).await;
        let err = response.error.unwrap();
        assert_eq!(err.kind, RemoteErrorKind::Handler);
        assert_eq!(err.message, "boom");

        let response = registry.handle(request("explode", ())).await;
        let err = response.error.unwrap();
        assert_eq!(err.kind, RemoteErrorKind::Panicked);
        assert!(err.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn rejects_undecodable_arguments() {
        let registry = registry();
        let mut bad = request("hello", ("zhang3",));
        bad.params = vec![Bytes::from_static(&[0xc1])];
        let response = registry.handle(bad).await;
        assert_eq!(response.error.unwrap().kind, RemoteErrorKind::BadArguments);
    }
}
