#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use vineyard::wire::{
    Message, MessageCodec, Packet, PacketCodec, Request, RequestMessage, SerializerRegistry,
};
use vineyard::{Config, Server, ServerHandle, Service, ServiceBuilder, ServiceRegistry, Value};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Calc;

impl Service for Calc {
    fn methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        builder
            .method("add", |_: &Calc, a: i64, b: i64| a + b)
            .method("add", |_: &Calc, a: f64, b: f64| a + b)
            .method("div", |_: &Calc, a: i64, b: i64| {
                a.checked_div(b).ok_or("division by zero")
            })
            .method("echo", |_: &Calc, v: Value| v)
            .method("sleep", |_: &Calc, ms: i64| {
                std::thread::sleep(Duration::from_millis(ms as u64));
                ms
            })
    }
}

pub fn calc_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry
        .register_service("Calc", Calc)
        .expect("fresh registry");
    registry
}

pub async fn start_server(config: Config) -> ServerHandle {
    init_tracing();
    Server::serve("127.0.0.1:0", calc_registry(), config)
        .await
        .expect("server should bind")
}

/// Config with short heartbeat windows for liveness tests.
pub fn fast_heartbeats(idle_ms: u64, grace_ms: u64) -> Config {
    Config {
        idle_window_ms: idle_ms,
        grace_window_ms: grace_ms,
        ..Config::default()
    }
}

/// A bare framed socket, for speaking the protocol by hand.
pub struct RawPeer {
    pub framed: Framed<TcpStream, PacketCodec>,
    pub codec: MessageCodec,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, PacketCodec::default()),
            codec: MessageCodec::new(vineyard::DEFAULT_MAGIC, SerializerRegistry::with_defaults()),
        }
    }

    pub async fn send_packet(&mut self, packet: Packet) {
        self.framed.send(packet).await.expect("send packet");
    }

    pub async fn send(&mut self, message: &Message) {
        let packet = self.codec.encode(message).expect("encode");
        self.send_packet(packet).await;
    }

    pub async fn request(&mut self, serializer: u8, request: Request) {
        let message = Message::Request(RequestMessage::new(
            vineyard::DEFAULT_MAGIC,
            serializer,
            request,
        ));
        self.send(&message).await;
    }

    /// Next packet, or `None` once the server has closed the connection.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("server should answer or close within 5s")
            .and_then(Result::ok)
    }

    pub async fn next_message(&mut self) -> Message {
        let packet = self.next_packet().await.expect("connection closed");
        self.codec.decode(packet).expect("decode")
    }
}
