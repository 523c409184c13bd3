//! TCP client.
//!
//! A [`Client`] holds one connection per server address and spreads calls
//! over the live ones round-robin. Each connection has its own correlation
//! table, so opaques are only unique per connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vineyard_wire::{
    CodecError, Message, MessageType, PacketHeader, Request, RequestMessage, Value,
};

use crate::connection::{Connection, Endpoint};
use crate::correlation::{CorrelationTable, ResponseHandle};
use crate::heartbeat::Role;
use crate::stat::{CallStats, StatStage};
use crate::{CallError, Config, PipelineBuilder};

/// One-shot call: connect to `address`, make one call, disconnect.
///
/// `timeout` defaults to the default config's call timeout.
pub async fn call(
    address: impl ToSocketAddrs + fmt::Display,
    bean: &str,
    method: &str,
    args: Vec<Value>,
    timeout: Option<Duration>,
) -> Result<Value, CallError> {
    let client = Client::connect([address], Config::default()).await?;
    let result = client.call(bean, method, args, timeout).await;
    client.close().await;
    result
}

pub struct Client {
    connections: Vec<ClientConnection>,
    next: AtomicUsize,
    default_timeout: Duration,
    stats: Arc<CallStats>,
}

impl Client {
    /// Connect to every reachable address in `addresses`.
    ///
    /// Unreachable addresses are logged and skipped; fails only if none
    /// connect.
    pub async fn connect<A>(
        addresses: impl IntoIterator<Item = A>,
        config: Config,
    ) -> Result<Self, CallError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let pipeline = PipelineBuilder::client(&config);
        Self::connect_with(addresses, config, pipeline).await
    }

    /// Like [`Client::connect`], with a custom pipeline.
    pub async fn connect_with<A>(
        addresses: impl IntoIterator<Item = A>,
        config: Config,
        pipeline: PipelineBuilder,
    ) -> Result<Self, CallError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        config.validate()?;
        let stats = Arc::new(CallStats::new());
        let pipeline = pipeline.add_first(StatStage::factory(Role::Client, stats.clone()));

        let mut connections = Vec::new();
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    let peer = match stream.peer_addr() {
                        Ok(peer) => peer,
                        Err(e) => {
                            tracing::warn!(address = %address, "connected socket has no peer: {e}");
                            last_error = Some(e);
                            continue;
                        }
                    };
                    tracing::debug!(peer = %peer, "connected");
                    connections.push(ClientConnection::spawn(stream, peer, &config, &pipeline));
                }
                Err(e) => {
                    tracing::warn!(address = %address, "unreachable, skipping: {e}");
                    last_error = Some(e);
                }
            }
        }

        if connections.is_empty() {
            return Err(last_error.map_or(CallError::NoConnection, CallError::Io));
        }
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            default_timeout: config.default_timeout(),
            stats,
        })
    }

    /// Call `bean.method(args)` on the next live connection.
    pub async fn call(
        &self,
        bean: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let connection = self.pick()?;
        connection
            .call(Request::new(bean, method, args), timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Call on the connection to `peer` specifically.
    pub async fn call_on(
        &self,
        peer: SocketAddr,
        bean: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let connection = self
            .connections
            .iter()
            .find(|c| c.peer == peer && c.is_live())
            .ok_or(CallError::NoConnection)?;
        connection
            .call(Request::new(bean, method, args), timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Write `request` on the next live connection and return a handle to
    /// its response. The request's opaque and timeout are overwritten.
    pub async fn send(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, CallError> {
        self.pick()?
            .send(request, timeout.unwrap_or(self.default_timeout))
            .await
    }

    pub fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.connections.iter().map(|c| c.peer)
    }

    pub fn live_connections(&self) -> usize {
        self.connections.iter().filter(|c| c.is_live()).count()
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Close every connection. Calls still pending fail with
    /// [`CallError::ConnectionClosed`].
    pub async fn close(mut self) {
        let connections = std::mem::take(&mut self.connections);
        for connection in &connections {
            connection.shutdown.cancel();
        }
        for connection in connections {
            if let Err(e) = connection.task.await {
                tracing::warn!(peer = %connection.peer, "connection task failed: {e}");
            }
        }
    }

    fn pick(&self) -> Result<&ClientConnection, CallError> {
        let n = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.connections[(start + i) % n])
            .find(|c| c.is_live())
            .ok_or(CallError::NoConnection)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.shutdown.cancel();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("peers", &self.peers().collect::<Vec<_>>())
            .field("live", &self.live_connections())
            .finish()
    }
}

struct ClientConnection {
    peer: SocketAddr,
    magic: u8,
    serializer: u8,
    outbound: mpsc::Sender<Message>,
    table: Arc<CorrelationTable>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientConnection {
    fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        config: &Config,
        pipeline: &PipelineBuilder,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_buffer);
        let table = CorrelationTable::new();
        let shutdown = CancellationToken::new();
        let endpoint = ClientEndpoint {
            peer,
            table: Arc::clone(&table),
        };
        let connection = Connection::new(
            stream,
            peer,
            config.packet_codec(),
            config.message_codec(),
            pipeline.build(),
            endpoint,
            rx,
            shutdown.clone(),
            config.tick_interval(),
        );
        Self {
            peer,
            magic: config.magic,
            serializer: config.serializer,
            outbound: tx,
            table,
            shutdown,
            task: tokio::spawn(connection.run()),
        }
    }

    fn is_live(&self) -> bool {
        !self.table.is_closed() && !self.outbound.is_closed()
    }

    async fn send(&self, request: Request, timeout: Duration) -> Result<ResponseHandle, CallError> {
        let handle = self.table.register(timeout)?;
        let timeout = handle.timeout();
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let request = request
            .with_opaque(handle.opaque())
            .with_timeout(timeout_ms);
        let message = Message::Request(RequestMessage::new(self.magic, self.serializer, request));

        match tokio::time::timeout_at(handle.deadline(), self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => Err(CallError::Timeout {
                opaque: handle.opaque(),
                timeout,
            }),
        }
    }

    async fn call(&self, request: Request, timeout: Duration) -> Result<Value, CallError> {
        let response = self.send(request, timeout).await?.wait().await?;
        response.outcome.map_err(CallError::Remote)
    }
}

/// Client side of a connection: responses go to the correlation table.
struct ClientEndpoint {
    peer: SocketAddr,
    table: Arc<CorrelationTable>,
}

impl Endpoint for ClientEndpoint {
    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Response(m) => {
                if !self.table.complete(m.response) {
                    tracing::warn!(
                        peer = %self.peer,
                        opaque = m.header.opaque,
                        "discarded response with no pending call"
                    );
                }
            }
            other => tracing::debug!(
                peer = %self.peer,
                message_type = ?other.message_type(),
                "ignoring unexpected message"
            ),
        }
    }

    fn on_undecodable(&mut self, header: PacketHeader, error: CodecError) -> Option<Message> {
        if header.message_type == MessageType::Response {
            self.table.fail(header.opaque, CallError::Codec(error));
        }
        None
    }

    fn on_encode_failed(&mut self, message: Message, error: CodecError) -> Option<Message> {
        if let Message::Request(m) = message {
            self.table.fail(m.request.opaque, CallError::Codec(error));
        }
        None
    }

    fn on_tick(&mut self, now: tokio::time::Instant) {
        self.table.expire(now);
    }

    fn on_closed(&mut self) {
        let failed = self.table.fail_all();
        if failed > 0 {
            tracing::debug!(peer = %self.peer, failed, "failed pending calls on close");
        }
    }
}
