//! Defines error handling constructs for courier.
//!
//! Errors are split by who observes them. [`RpcError`] is what a caller sees when a call fails,
//! [`RemoteError`] is the serializable failure a server writes into a response, [`ServiceError`]
//! is produced while dispatching a request on the server, and [`RegistryError`] covers the
//! coordination service. Connection-level failures are handled inside the connection manager
//! and never reach callers directly.

use std::{error, fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub use crate::codec::CodecError;
use crate::wire::RequestId;

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Error returned to the caller of a remote method.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No response arrived within the call timeout.
    ///
    /// The request is not cancelled; a late response is dropped.
    #[error("timed out waiting for response to {service}.{method}, request_id: {request_id}")]
    Timeout {
        /// Id of the request that timed out.
        request_id: RequestId,
        /// Target service name.
        service: String,
        /// Target method name.
        method: String,
    },
    /// No connected peer became available while waiting for one.
    #[error("no connected peer available after waiting {waited:?}")]
    NoPeerAvailable {
        /// How long the caller waited before giving up.
        waited: Duration,
    },
    /// The connection manager was stopped.
    #[error("connection manager stopped")]
    Stopped,
    /// The remote method failed.
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    /// The request or response could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A bounded queue was full and the work was rejected.
    #[error("rejected: queue is full")]
    Rejected,
    /// The connection closed before the request could be written.
    #[error("connection closed")]
    ConnectionClosed,
    /// The call completed without a result that could be decoded into the expected type.
    #[error("call completed without a result")]
    NoResult,
}

/// The category of a [`RemoteError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The target service is not registered on the server.
    UnknownService,
    /// The service has no method matching the name and parameter types.
    UnknownMethod,
    /// The arguments could not be decoded into the method's parameter types.
    BadArguments,
    /// The method returned an error.
    Handler,
    /// The method panicked.
    Panicked,
    /// The server's worker pool was full.
    Rejected,
    /// The result could not be encoded.
    Encode,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::UnknownService => write!(f, "unknown service"),
            RemoteErrorKind::UnknownMethod => write!(f, "unknown method"),
            RemoteErrorKind::BadArguments => write!(f, "bad arguments"),
            RemoteErrorKind::Handler => write!(f, "handler error"),
            RemoteErrorKind::Panicked => write!(f, "handler panicked"),
            RemoteErrorKind::Rejected => write!(f, "rejected"),
            RemoteErrorKind::Encode => write!(f, "encode error"),
        }
    }
}

/// A failure captured on the server and carried back in a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// What went wrong.
    pub kind: RemoteErrorKind,
    /// The original failure, rendered on the server.
    pub message: String,
}

impl RemoteError {
    /// Creates a new remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }
}

/// Error produced while dispatching a request to a registered service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No service is registered under the requested name.
    #[error("service `{0}` is not registered")]
    UnknownService(String),
    /// The service has no method with the requested signature.
    #[error("service `{service}` has no method `{signature}`")]
    UnknownMethod {
        /// The service name.
        service: String,
        /// The requested `method@types` signature.
        signature: String,
    },
    /// The arguments did not decode into the method's parameter types.
    #[error("failed to decode arguments: {0}")]
    BadArguments(#[source] CodecError),
    /// The method result could not be encoded.
    #[error("failed to encode result: {0}")]
    Encode(#[source] CodecError),
    /// The method returned an error.
    #[error("{0}")]
    Handler(String),
    /// The method panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl ServiceError {
    /// Wraps any displayable error returned by a service method.
    pub fn handler(err: impl fmt::Display) -> Self {
        ServiceError::Handler(err.to_string())
    }
}

impl From<ServiceError> for RemoteError {
    fn from(err: ServiceError) -> Self {
        let kind = match &err {
            ServiceError::UnknownService(_) => RemoteErrorKind::UnknownService,
            ServiceError::UnknownMethod { .. } => RemoteErrorKind::UnknownMethod,
            ServiceError::BadArguments(_) => RemoteErrorKind::BadArguments,
            ServiceError::Encode(_) => RemoteErrorKind::Encode,
            ServiceError::Handler(_) => RemoteErrorKind::Handler,
            ServiceError::Panicked(_) => RemoteErrorKind::Panicked,
        };
        RemoteError::new(kind, err.to_string())
    }
}

/// Error returned by the coordination service or while interpreting registry data.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The node already exists.
    #[error("node `{0}` already exists")]
    NodeExists(String),
    /// The path is not a valid absolute node path.
    #[error("invalid node path `{0}`")]
    InvalidPath(String),
    /// The coordinator session has been closed.
    #[error("coordinator session closed")]
    SessionClosed,
    /// Node data could not be interpreted.
    #[error("malformed data at `{path}`: {reason}")]
    MalformedData {
        /// The node path.
        path: String,
        /// Why the data was rejected.
        reason: String,
    },
    /// JSON encoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Any other coordinator failure.
    #[error(transparent)]
    Other(#[from] BoxError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_maps_to_remote_kind() {
        let remote: RemoteError = ServiceError::UnknownService("Foo".to_string()).into();
        assert_eq!(remote.kind, RemoteErrorKind::UnknownService);
        assert_eq!(remote.message, "service `Foo` is not registered");

        let remote: RemoteError = ServiceError::handler("boom").into();
        assert_eq!(remote.kind, RemoteErrorKind::Handler);
        assert_eq!(remote.to_string(), "handler error: boom");
    }

    #[test]
    fn timeout_names_request_and_method() {
        let request_id = RequestId::generate();
        let err = RpcError::Timeout {
            request_id,
            service: "HelloService".to_string(),
            method: "hello".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains(&request_id.to_string()));
        assert!(msg.contains("HelloService"));
        assert!(msg.contains("hello"));
    }
}
