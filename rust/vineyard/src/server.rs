//! TCP server.
//!
//! ```no_run
//! # async fn run() -> Result<(), vineyard::ServerError> {
//! use vineyard::{Config, Server, ServiceBuilder, ServiceRegistry};
//!
//! struct Calc;
//! let mut registry = ServiceRegistry::new();
//! registry
//!     .register(
//!         "Calc",
//!         ServiceBuilder::new(Calc)
//!             .method("add", |_: &Calc, a: i64, b: i64| a + b)
//!             .build(),
//!     )
//!     .expect("fresh registry");
//!
//! let server = Server::serve("127.0.0.1:7070", registry, Config::default()).await?;
//! println!("listening on {}", server.local_addr());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vineyard_wire::{
    CodecError, ErrorKind, Message, MessageType, PacketHeader, RemoteError, Response,
    ResponseMessage,
};

use crate::connection::{Connection, Endpoint};
use crate::heartbeat::Role;
use crate::stat::{CallStats, StatStage};
use crate::{Config, Dispatcher, PipelineBuilder, ServerError, ServiceRegistry};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server;

impl Server {
    /// Bind `addr` and serve `registry` with the default server pipeline.
    pub async fn serve(
        addr: impl ToSocketAddrs,
        registry: ServiceRegistry,
        config: Config,
    ) -> Result<ServerHandle, ServerError> {
        let pipeline = PipelineBuilder::server(&config);
        Self::serve_with(addr, registry, config, pipeline).await
    }

    /// Like [`Server::serve`], with a custom pipeline. Call statistics are
    /// always recorded by a stage added at the application end.
    pub async fn serve_with(
        addr: impl ToSocketAddrs,
        registry: ServiceRegistry,
        config: Config,
        pipeline: PipelineBuilder,
    ) -> Result<ServerHandle, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let stats = Arc::new(CallStats::new());
        let pipeline = pipeline.add_first(StatStage::factory(Role::Server, stats.clone()));
        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();

        let context = Arc::new(ServerContext {
            dispatcher: Dispatcher::new(Arc::new(registry), config.max_concurrent_dispatch),
            pipeline,
            config,
            shutdown: shutdown.clone(),
            connections: connections.clone(),
        });

        tracing::info!(
            addr = %local_addr,
            services = context.dispatcher.registry().len(),
            "server listening"
        );
        let accept = tokio::spawn(accept_loop(listener, context));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            connections,
            accept: Some(accept),
            stats,
        })
    }
}

struct ServerContext {
    config: Config,
    dispatcher: Dispatcher,
    pipeline: PipelineBuilder,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

async fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) {
    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted connection");
                    spawn_connection(&context, stream, peer);
                }
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::info!("server stopped accepting");
}

fn spawn_connection(context: &ServerContext, stream: TcpStream, peer: SocketAddr) {
    let config = &context.config;
    let (tx, rx) = mpsc::channel(config.outbound_buffer);
    let endpoint = ServerEndpoint {
        peer,
        dispatcher: context.dispatcher.clone(),
        in_flight: TaskTracker::new(),
        outbound: Some(tx),
        magic: config.magic,
        default_serializer: config.serializer,
    };
    let connection = Connection::new(
        stream,
        peer,
        config.packet_codec(),
        config.message_codec(),
        context.pipeline.build(),
        endpoint,
        rx,
        context.shutdown.child_token(),
        config.tick_interval(),
    );
    context.connections.spawn(connection.run());
}

/// Server side of a connection: requests go to the dispatcher, replies come
/// back through the outbound channel.
struct ServerEndpoint {
    peer: SocketAddr,
    dispatcher: Dispatcher,
    in_flight: TaskTracker,
    outbound: Option<mpsc::Sender<Message>>,
    magic: u8,
    default_serializer: u8,
}

impl ServerEndpoint {
    fn error_reply(&self, header: &PacketHeader, error: &CodecError) -> Message {
        let (kind, serializer) = match error {
            // Answer in a serializer the peer can at least hope to read.
            CodecError::UnsupportedSerializer(_) => {
                (ErrorKind::UnsupportedSerializer, self.default_serializer)
            }
            _ => (ErrorKind::Serialization, header.serializer_type),
        };
        Message::Response(ResponseMessage::new(
            self.magic,
            serializer,
            Response::failure(header.opaque, RemoteError::new(kind, error.to_string())),
        ))
    }
}

impl Endpoint for ServerEndpoint {
    async fn on_message(&mut self, message: Message) {
        let Message::Request(request) = message else {
            tracing::debug!(
                peer = %self.peer,
                message_type = ?message.message_type(),
                "ignoring unexpected message"
            );
            return;
        };
        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        // Hold the read side until a worker is free.
        let permit = self.dispatcher.reserve().await;
        let dispatcher = self.dispatcher.clone();
        let peer = self.peer;
        self.in_flight.spawn(async move {
            let opaque = request.request.opaque;
            let reply = match permit {
                Some(permit) => dispatcher.run(permit, request).await,
                // Closed dispatcher: this answers with an error at once.
                None => dispatcher.dispatch(request).await,
            };
            if outbound.send(Message::Response(reply)).await.is_err() {
                tracing::debug!(peer = %peer, opaque, "connection gone before reply was written");
            }
        });
    }

    fn on_undecodable(&mut self, header: PacketHeader, error: CodecError) -> Option<Message> {
        (header.message_type == MessageType::Request).then(|| self.error_reply(&header, &error))
    }

    fn on_encode_failed(&mut self, message: Message, error: CodecError) -> Option<Message> {
        match message {
            Message::Response(m) if m.response.is_success() => {
                Some(self.error_reply(&m.header, &CodecError::Serialization(error.to_string())))
            }
            _ => None,
        }
    }

    fn begin_shutdown(&mut self) -> Option<TaskTracker> {
        self.outbound = None;
        Some(self.in_flight.clone())
    }

    fn on_closed(&mut self) {
        self.outbound = None;
        self.in_flight.close();
    }
}

/// A running server.
///
/// Dropping the handle stops accepting and closes connections without
/// waiting; use [`ServerHandle::stop`] to drain in-flight calls first.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept: Option<JoinHandle<()>>,
    stats: Arc<CallStats>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Connections currently open.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, stop reading new requests, wait for in-flight calls
    /// to finish and their responses to be written, then close every
    /// connection.
    pub async fn stop(mut self) {
        tracing::info!(addr = %self.local_addr, "stopping server");
        self.shutdown.cancel();
        if let Some(accept) = self.accept.take() {
            if let Err(e) = accept.await {
                tracing::warn!("accept task failed: {e}");
            }
        }
        self.connections.close();
        self.connections.wait().await;
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish()
    }
}
