//! The server side of an RPC connection.
//!
//! An [`RpcServer`] accepts connections, decodes request frames and runs each request on a
//! bounded worker pool. Results and failures are written back as response frames on the
//! connection the request arrived on. When the pool's queue is full the request is answered
//! immediately with a `Rejected` error instead of being queued.
//!
//! # Example
//!
//! ```no_run
//! use courier::{
//!     config::ServerConfig,
//!     error::ServiceError,
//!     server::{MethodTable, RpcServer},
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let server = RpcServer::bind("127.0.0.1:8765", ServerConfig::default()).await?;
//! server.register(MethodTable::new("HelloService").method(
//!     "hello",
//!     |(name,): (String,)| async move { Ok::<_, ServiceError>(format!("hello! {name}")) },
//! ));
//! server.wait().await;
//! # Ok(())
//! # }
//! ```

mod dispatch;

use std::{fmt, io, net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
pub use dispatch::{method_signature, MethodTable, Service, ServiceRegistry};
pub use futures::future::BoxFuture;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        lookup_host, tcp::OwnedWriteHalf, TcpListener, TcpSocket, TcpStream, ToSocketAddrs,
    },
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::{RemoteError, RemoteErrorKind, RpcError},
    pool::WorkerPool,
    wire::{FrameDecoder, FrameEncoder, Request, Response},
};

/// Accepts connections and dispatches requests to registered services.
pub struct RpcServer {
    local_addr: SocketAddr,
    services: ServiceRegistry,
    pool: WorkerPool,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    /// Binds a listener on `addr` and starts accepting connections.
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> io::Result<Self> {
        let addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "could not resolve bind address")
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        let services = ServiceRegistry::new();
        let pool = WorkerPool::new("server", config.workers, config.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            services.clone(),
            pool.clone(),
            Arc::new(config),
            shutdown_rx,
        ));
        info!(%local_addr, "server started");

        Ok(RpcServer {
            local_addr,
            services,
            pool,
            shutdown,
        })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Exports a service, replacing any service with the same name.
    pub fn register(&self, service: impl Service) {
        let name = service.name().to_string();
        if self.services.insert(Arc::new(service)).is_some() {
            warn!(service = %name, "replaced registered service");
        } else {
            info!(service = %name, "registered service");
        }
    }

    /// Returns the exported services.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Stops accepting connections, closes open ones and stops the worker pool.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(local_addr = %self.local_addr, "server shutting down");
        }
        self.pool.shutdown();
    }

    /// Waits until the server is shut down.
    pub async fn wait(&self) {
        shutdown_signal(&mut self.shutdown.subscribe()).await;
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .field("services", &self.services)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    services: ServiceRegistry,
    pool: WorkerPool,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "accepted connection");
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer_addr, %err, "failed to set nodelay");
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        peer_addr,
                        services.clone(),
                        pool.clone(),
                        config.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(%err, "failed to accept connection"),
            },
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|shutdown| *shutdown).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    services: ServiceRegistry,
    pool: WorkerPool,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
    let writer = tokio::spawn(write_loop(peer_addr, writer, outbound_rx));
    let encoder = Arc::new(FrameEncoder::<Response>::new(config.max_frame_len));
    let decoder = FrameDecoder::<Request>::new(config.max_frame_len);
    let mut buf = BytesMut::with_capacity(8 * 1024);

    'read: loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(%peer_addr, "connection closed by client");
                    break;
                }
                Ok(_) => loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(request)) => {
                            dispatch(request, &services, &pool, &encoder, &outbound_tx, peer_addr)
                                .await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!(%peer_addr, %err, "failed to decode request, closing");
                            break 'read;
                        }
                    }
                },
                Err(err) => {
                    warn!(%peer_addr, %err, "failed to read from connection");
                    break;
                }
            },
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }

    drop(outbound_tx);
    if *shutdown.borrow() {
        writer.abort();
    }
}

async fn dispatch(
    request: Request,
    services: &ServiceRegistry,
    pool: &WorkerPool,
    encoder: &Arc<FrameEncoder<Response>>,
    outbound: &mpsc::Sender<Bytes>,
    peer_addr: SocketAddr,
) {
    let id = request.id;
    let job = {
        let services = services.clone();
        let encoder = encoder.clone();
        let outbound = outbound.clone();
        async move {
            let response = services.handle(request).await;
            send_response(&encoder, &outbound, response, peer_addr).await;
        }
    };
    match pool.try_submit(job) {
        Ok(()) => {}
        Err(RpcError::Rejected) => {
            let response = Response::err(
                id,
                RemoteError::new(RemoteErrorKind::Rejected, "server worker queue is full"),
            );
            send_response(encoder, outbound, response, peer_addr).await;
        }
        Err(err) => {
            debug!(%peer_addr, request_id = %id, %err, "dropping request");
        }
    }
}

async fn send_response(
    encoder: &FrameEncoder<Response>,
    outbound: &mpsc::Sender<Bytes>,
    response: Response,
    peer_addr: SocketAddr,
) {
    let id = response.id;
    let frame = match encoder.encode_to_bytes(&response) {
        Ok(frame) => frame,
        Err(err) => {
            error!(%peer_addr, request_id = %id, %err, "failed to encode response");
            let fallback = Response::err(
                id,
                RemoteError::new(RemoteErrorKind::Encode, err.to_string()),
            );
            match encoder.encode_to_bytes(&fallback) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    if outbound.send(frame).await.is_err() {
        warn!(%peer_addr, request_id = %id, "connection closed before response was written");
    }
}

async fn write_loop(
    peer_addr: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            warn!(%peer_addr, %err, "failed to write response");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(%peer_addr, %err, "failed to shut down connection");
    }
}
