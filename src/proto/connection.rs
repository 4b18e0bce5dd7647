//! One TCP peer: frame pump, request correlation, connection-scoped auth.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{Frame, FrameCodec};
use super::{Message, Request, Response};
use crate::error::{FabricError, Result};

/// Sequence numbers wrap below this bound, skipping 0.
const SEQUENCE_LIMIT: u64 = 999_999;

/// How long a pending request waits for its response before the entry is
/// dropped from the outstanding table.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection-scoped authentication policy.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub password: Option<String>,
    pub always_allow_localhost: bool,
}

impl AuthPolicy {
    fn initially_authorized(&self, peer: SocketAddr) -> bool {
        self.password.is_none() || (self.always_allow_localhost && peer.ip().is_loopback())
    }

    fn matches(&self, offered: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => offered == Some(expected.as_str()),
        }
    }
}

/// Handles decoded requests for a daemon. The connection converts an `Err`
/// uniformly into an error response carrying the request's `no`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request, conn: &Connection) -> Result<Value>;
}

enum WriteOp {
    Message(Message),
    Shutdown,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Response>>>;
type CloseCallback = Box<dyn FnOnce() + Send>;

struct ConnectionInner {
    id: Uuid,
    peer: SocketAddr,
    outgoing: mpsc::UnboundedSender<WriteOp>,
    pending: Mutex<PendingMap>,
    next_no: Mutex<u64>,
    authorized: AtomicBool,
    closed: CancellationToken,
    on_close: Mutex<Vec<CloseCallback>>,
    /// Password offered on outgoing requests (the client side of a link).
    peer_password: Option<String>,
}

/// Cloneable handle to one TCP peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an accepted socket and start its read/write pumps.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        auth: AuthPolicy,
        handler: Arc<dyn RequestHandler>,
    ) -> Connection {
        Self::start(stream, peer, auth, None, handler)
    }

    /// Dial a peer. Requests sent on this connection carry `password`, and
    /// incoming requests from the peer are trusted (we dialed it).
    pub async fn connect(
        addr: &str,
        password: Option<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        Ok(Self::start(
            stream,
            peer,
            AuthPolicy::default(),
            password,
            handler,
        ))
    }

    fn start(
        stream: TcpStream,
        peer: SocketAddr,
        auth: AuthPolicy,
        peer_password: Option<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Connection {
        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, source) = framed.split();
        let (outgoing, mut write_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            peer,
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_no: Mutex::new(rand::thread_rng().gen_range(1..SEQUENCE_LIMIT)),
            authorized: AtomicBool::new(auth.initially_authorized(peer)),
            closed: CancellationToken::new(),
            on_close: Mutex::new(Vec::new()),
            peer_password,
        });
        let conn = Connection { inner };

        tokio::spawn(async move {
            while let Some(op) = write_rx.recv().await {
                match op {
                    WriteOp::Message(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    WriteOp::Shutdown => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            reader.read_loop(source, auth, handler).await;
        });

        conn
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::Acquire)
    }

    /// Queue a message for the write pump.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner
            .outgoing
            .send(WriteOp::Message(message))
            .map_err(|_| FabricError::SocketClosed)
    }

    /// Send a request and wait for the correlated response. The pending entry
    /// is removed on response, on timeout, or when the connection closes (in
    /// which case the future fails with a socket-closed error).
    pub async fn send_request(&self, kind: &str, data: Option<Value>) -> Result<Response> {
        if self.is_closed() {
            return Err(FabricError::SocketClosed);
        }
        let no = self.next_no().await;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(no, tx);

        let request = Request {
            no,
            kind: kind.to_string(),
            data,
            password: self.inner.peer_password.clone(),
        };
        if let Err(e) = self.send(Message::Request(request)) {
            self.inner.pending.lock().await.remove(&no);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FabricError::SocketClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&no);
                Err(FabricError::RequestTimeout)
            }
        }
    }

    /// Ask the write pump to flush queued messages and close the socket. The
    /// peer sees EOF; close bookkeeping runs when our read side drains.
    pub fn close(&self) {
        let _ = self.inner.outgoing.send(WriteOp::Shutdown);
    }

    /// Resolves when the connection has closed.
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Register a callback fired exactly once when the connection closes.
    /// Fires immediately if the connection is already closed.
    pub async fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.inner.on_close.lock().await;
            if !self.inner.closed.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    async fn next_no(&self) -> u64 {
        let mut guard = self.inner.next_no.lock().await;
        let no = *guard;
        *guard = if no + 1 >= SEQUENCE_LIMIT { 1 } else { no + 1 };
        no
    }

    async fn read_loop(
        &self,
        mut source: SplitStream<Framed<TcpStream, FrameCodec>>,
        auth: AuthPolicy,
        handler: Arc<dyn RequestHandler>,
    ) {
        while let Some(decoded) = source.next().await {
            match decoded {
                Ok(Frame::Message(message)) => {
                    if self.dispatch(message, &auth, &handler).await.is_break() {
                        break;
                    }
                }
                Ok(Frame::Invalid(reason)) => {
                    tracing::warn!(peer = %self.peer(), reason, "invalid frame");
                    let _ = self.send(Message::Response(Response::err(0, reason)));
                }
                Err(e) => {
                    tracing::debug!(peer = %self.peer(), error = %e, "read failed");
                    break;
                }
            }
        }
        self.finish().await;
    }

    async fn dispatch(
        &self,
        message: Message,
        auth: &AuthPolicy,
        handler: &Arc<dyn RequestHandler>,
    ) -> std::ops::ControlFlow<()> {
        match message {
            Message::Ping => {
                let _ = self.send(Message::Pong);
            }
            Message::Pong => {}
            Message::Response(response) => {
                match self.inner.pending.lock().await.remove(&response.no) {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        tracing::warn!(peer = %self.peer(), no = response.no, "unsolicited response")
                    }
                }
            }
            Message::Request(request) => {
                if !self.inner.authorized.load(Ordering::Acquire) {
                    if auth.matches(request.password.as_deref()) {
                        self.inner.authorized.store(true, Ordering::Release);
                    } else {
                        tracing::warn!(peer = %self.peer(), "rejecting unauthorized request");
                        let _ = self.send(Message::Response(Response::err(
                            request.no,
                            FabricError::InvalidPassword.to_string(),
                        )));
                        return std::ops::ControlFlow::Break(());
                    }
                }
                let conn = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let no = request.no;
                    let kind = request.kind.clone();
                    let response = match handler.handle(request, &conn).await {
                        Ok(data) => Response::ok(no, data),
                        Err(e) => {
                            tracing::debug!(kind, error = %e, "request failed");
                            Response::err(no, e.to_string())
                        }
                    };
                    let _ = conn.send(Message::Response(response));
                });
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Close bookkeeping: cancel the token, stop the write pump, reject every
    /// outstanding request, fire close callbacks.
    async fn finish(&self) {
        self.inner.closed.cancel();
        let _ = self.inner.outgoing.send(WriteOp::Shutdown);

        let pending: Vec<_> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(FabricError::SocketClosed));
        }

        let callbacks: Vec<CloseCallback> = {
            let mut callbacks = self.inner.on_close.lock().await;
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback();
        }
        tracing::debug!(peer = %self.peer(), "connection closed");
    }
}
