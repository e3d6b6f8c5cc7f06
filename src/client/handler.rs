use std::{fmt, io, net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tracing::{debug, error, trace, warn};

use crate::{
    config::ClientConfig,
    error::RpcError,
    future::{CallState, RpcFuture},
    pool::WorkerPool,
    wire::{FrameDecoder, FrameEncoder, Request, RequestId, Response},
};

type PendingCalls = Arc<DashMap<RequestId, Arc<CallState>>>;

enum Outbound {
    Frame(Bytes),
    Shutdown,
}

/// One live connection to a server.
///
/// Writes requests onto the connection and completes pending calls as responses are read back.
/// A reader task and a writer task own the two halves of the socket; the handler itself only
/// queues frames, so sending never blocks on the network.
pub struct ConnectionHandler {
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    pending: PendingCalls,
    closed: Arc<watch::Sender<bool>>,
    encoder: FrameEncoder<Request>,
    callback_pool: WorkerPool,
}

impl ConnectionHandler {
    /// Takes ownership of a connected stream and starts its reader and writer tasks.
    pub(crate) fn spawn(
        stream: TcpStream,
        config: &ClientConfig,
        callback_pool: WorkerPool,
    ) -> io::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let pending = PendingCalls::default();

        tokio::spawn(write_loop(remote_addr, writer, outbound_rx, closed.clone()));
        tokio::spawn(read_loop(
            remote_addr,
            reader,
            FrameDecoder::new(config.max_frame_len),
            pending.clone(),
            closed.clone(),
        ));

        Ok(Arc::new(ConnectionHandler {
            remote_addr,
            outbound: outbound_tx,
            pending,
            closed,
            encoder: FrameEncoder::new(config.max_frame_len),
            callback_pool,
        }))
    }

    /// Returns the address of the connected server.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the number of calls waiting for a response on this connection.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` once the connection has closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Registers a pending call for `request` and queues it for writing.
    ///
    /// Returns as soon as the frame is queued. Write failures are not reported here; the call
    /// then simply never completes and the caller's timeout applies.
    pub fn send_request<R>(&self, request: Request) -> Result<RpcFuture<R>, RpcError> {
        let frame = self.encoder.encode_to_bytes(&request)?;
        let state = CallState::new(&request, self.callback_pool.clone());
        self.pending.insert(request.id, state.clone());

        if let Err(err) = self.outbound.try_send(Outbound::Frame(frame)) {
            self.pending.remove(&request.id);
            return Err(match err {
                TrySendError::Full(_) => {
                    warn!(remote_addr = %self.remote_addr, "outbound queue is full");
                    RpcError::Rejected
                }
                TrySendError::Closed(_) => RpcError::ConnectionClosed,
            });
        }
        trace!(
            remote_addr = %self.remote_addr,
            request_id = %request.id,
            service = %request.service,
            method = %request.method,
            "queued request"
        );

        Ok(RpcFuture::new(state))
    }

    /// Flushes queued frames and then closes the connection.
    pub fn close(&self) {
        if self.outbound.try_send(Outbound::Shutdown).is_err() {
            self.closed.send_replace(true);
        }
    }

    /// Waits until the connection has closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await;
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("remote_addr", &self.remote_addr)
            .field("pending_calls", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop(
    remote_addr: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        warn!(%remote_addr, %err, "failed to write request");
                        break;
                    }
                }
                Some(Outbound::Shutdown) | None => {
                    if let Err(err) = writer.shutdown().await {
                        debug!(%remote_addr, %err, "failed to shut down connection");
                    }
                    break;
                }
            },
            _ = wait_closed(&mut closed_rx) => break,
        }
    }
    drop(outbound);
    closed.send_replace(true);
}

async fn read_loop(
    remote_addr: SocketAddr,
    mut reader: OwnedReadHalf,
    decoder: FrameDecoder<Response>,
    pending: PendingCalls,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    'read: loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(%remote_addr, "connection closed by server");
                    break;
                }
                Ok(_) => loop {
                    match decoder.decode(&mut buf) {
                        Ok(Some(response)) => complete(&pending, response),
                        Ok(None) => break,
                        Err(err) => {
                            error!(%remote_addr, %err, "failed to decode response");
                            break 'read;
                        }
                    }
                },
                Err(err) => {
                    warn!(%remote_addr, %err, "failed to read from connection");
                    break;
                }
            },
            _ = wait_closed(&mut closed_rx) => break,
        }
    }
    closed.send_replace(true);
}

/// Resolves once the connection is marked closed, or its close signal is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

fn complete(pending: &PendingCalls, response: Response) {
    match pending.remove(&response.id) {
        Some((_, state)) => {
            state.complete(response);
        }
        None => {
            warn!(request_id = %response.id, "no pending call for response");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::AsyncWriteExt,
        net::TcpListener,
        time,
    };

    use super::*;
    use crate::{codec::Encode, wire::MAX_FRAME_LEN};

    async fn connected_pair() -> (Arc<ConnectionHandler>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let handler = ConnectionHandler::spawn(
            client.unwrap(),
            &ClientConfig::default(),
            WorkerPool::new("callbacks", 1, 8),
        )
        .unwrap();
        (handler, accepted.unwrap().0)
    }

    fn hello_request(name: &str) -> Request {
        Request::new(
            "HelloService",
            "hello",
            vec!["string".to_string()],
            vec![name.encode().unwrap()],
        )
    }

    async fn read_requests(stream: &mut TcpStream, n: usize) -> Vec<Request> {
        let decoder = FrameDecoder::<Request>::new(MAX_FRAME_LEN);
        let mut buf = BytesMut::new();
        let mut requests = Vec::new();
        while requests.len() < n {
            match decoder.decode(&mut buf).unwrap() {
                Some(request) => requests.push(request),
                None => assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0),
            }
        }
        requests
    }

    #[tokio::test]
    async fn close_flushes_queued_requests() {
        let (handler, mut server) = connected_pair().await;
        let ids: Vec<RequestId> = ["zhang3", "li4", "wang5"]
            .into_iter()
            .map(|name| {
                handler
                    .send_request::<String>(hello_request(name))
                    .unwrap()
                    .request_id()
            })
            .collect();
        handler.close();

        let mut received = Vec::new();
        time::timeout(Duration::from_secs(5), server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        let decoder = FrameDecoder::<Request>::new(MAX_FRAME_LEN);
        let mut buf = BytesMut::from(&received[..]);
        let mut received_ids = Vec::new();
        while let Some(request) = decoder.decode(&mut buf).unwrap() {
            received_ids.push(request.id);
        }
        assert_eq!(received_ids, ids);
        assert!(buf.is_empty());

        time::timeout(Duration::from_secs(5), handler.closed())
            .await
            .unwrap();
        assert!(handler.is_closed());
        assert!(matches!(
            handler.send_request::<String>(hello_request("late")),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unmatched_responses_are_dropped() {
        let (handler, mut server) = connected_pair().await;
        let first = handler
            .send_request::<String>(hello_request("zhang3"))
            .unwrap();
        let second = handler.send_request::<String>(hello_request("li4")).unwrap();
        let requests = read_requests(&mut server, 2).await;
        let encoder = FrameEncoder::<Response>::new(MAX_FRAME_LEN);

        // A response nobody is waiting for, then the answer to the second call.
        let mut out = BytesMut::new();
        encoder
            .encode(
                &Response::ok(RequestId::generate(), "stray".encode().unwrap()),
                &mut out,
            )
            .unwrap();
        encoder
            .encode(
                &Response::ok(requests[1].id, "hello! li4".encode().unwrap()),
                &mut out,
            )
            .unwrap();
        server.write_all(&out).await.unwrap();

        let reply = time::timeout(Duration::from_secs(5), second.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "hello! li4");
        assert!(!first.is_done());
        assert_eq!(handler.pending_calls(), 1);

        // A duplicate for the already completed call must not disturb the first one.
        let mut out = BytesMut::new();
        encoder
            .encode(
                &Response::ok(requests[1].id, "duplicate".encode().unwrap()),
                &mut out,
            )
            .unwrap();
        encoder
            .encode(
                &Response::ok(requests[0].id, "hello! zhang3".encode().unwrap()),
                &mut out,
            )
            .unwrap();
        server.write_all(&out).await.unwrap();

        let reply = time::timeout(Duration::from_secs(5), first.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "hello! zhang3");
        assert_eq!(second.get().await.unwrap(), "hello! li4");
        assert_eq!(handler.pending_calls(), 0);
        assert!(!handler.is_closed());
    }
}
