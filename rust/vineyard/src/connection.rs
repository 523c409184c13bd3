//! The per-connection task.
//!
//! One task owns a socket: it reads frames, decodes them strictly in
//! arrival order, runs them through the pipeline, and hands what comes out
//! to an [`Endpoint`]. Everything written to the socket goes through the
//! same task, via the connection's outbound channel, so writes never
//! interleave.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vineyard_wire::{
    CodecError, Message, MessageCodec, Packet, PacketCodec, PacketHeader, ProtocolError,
};

use crate::pipeline::{Flow, Pipeline};

/// What a connection task serves: the server's dispatcher or a client's
/// correlation table.
pub(crate) trait Endpoint: Send + 'static {
    /// A message that made it through the pipeline. The connection reads
    /// nothing else until this returns, so awaiting here pushes back on the
    /// peer.
    fn on_message(&mut self, message: Message) -> impl Future<Output = ()> + Send;

    /// A request or response whose body could not be decoded. May return a
    /// reply to write.
    fn on_undecodable(&mut self, header: PacketHeader, error: CodecError) -> Option<Message>;

    /// `message` could not be encoded. May return a replacement to write.
    fn on_encode_failed(&mut self, message: Message, error: CodecError) -> Option<Message>;

    fn on_tick(&mut self, _now: Instant) {}

    /// Shutdown was requested. Returns the work that must finish, and have
    /// its output flushed, before the socket closes.
    fn begin_shutdown(&mut self) -> Option<TaskTracker> {
        None
    }

    fn on_closed(&mut self);
}

#[derive(Debug)]
pub(crate) enum CloseReason {
    PeerClosed,
    Protocol(ProtocolError),
    Write(ProtocolError),
    /// A pipeline stage asked to close.
    Requested(String),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::Write(e) => write!(f, "write failed: {e}"),
            CloseReason::Requested(reason) => write!(f, "{reason}"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

type Step = Result<(), CloseReason>;

pub(crate) struct Connection<E> {
    peer: SocketAddr,
    reader: FramedRead<OwnedReadHalf, PacketCodec>,
    writer: FramedWrite<OwnedWriteHalf, PacketCodec>,
    codec: MessageCodec,
    pipeline: Pipeline,
    endpoint: E,
    outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    tick: Duration,
}

impl<E: Endpoint> Connection<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        packets: PacketCodec,
        codec: MessageCodec,
        pipeline: Pipeline,
        endpoint: E,
        outbound: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
        tick: Duration,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, "failed to set TCP_NODELAY: {e}");
        }
        let (read, write) = stream.into_split();
        Self {
            peer,
            reader: FramedRead::new(read, packets),
            writer: FramedWrite::new(write, packets),
            codec,
            pipeline,
            endpoint,
            outbound,
            shutdown,
            tick,
        }
    }

    /// Drive the connection until it closes.
    pub(crate) async fn run(mut self) {
        let reason = self.serve().await;

        self.pipeline.close(Instant::now());
        self.endpoint.on_closed();
        if let Err(e) = self.writer.close().await {
            tracing::debug!(peer = %self.peer, "error closing socket: {e}");
        }

        match &reason {
            CloseReason::Protocol(e) => {
                tracing::warn!(peer = %self.peer, "closing connection on protocol error: {e}")
            }
            CloseReason::Write(_) | CloseReason::Requested(_) => {
                tracing::info!(peer = %self.peer, %reason, "connection closed")
            }
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                tracing::debug!(peer = %self.peer, %reason, "connection closed")
            }
        }
    }

    async fn serve(&mut self) -> CloseReason {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => return self.drain().await,
                frame = self.reader.next() => match frame {
                    Some(Ok(packet)) => self.on_packet(packet).await,
                    Some(Err(e)) => Err(CloseReason::Protocol(e)),
                    None => Err(CloseReason::PeerClosed),
                },
                Some(message) = self.outbound.recv() => self.send(message).await,
                _ = ticker.tick() => self.on_tick().await,
            };
            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn on_packet(&mut self, packet: Packet) -> Step {
        let now = Instant::now();
        let flow = self.pipeline.frame_received(now);
        self.apply(flow).await?;

        let header = packet.header;
        match self.codec.decode(packet) {
            Ok(message) => {
                let flow = self.pipeline.inbound(message, now);
                self.apply(flow).await
            }
            Err(CodecError::Protocol(e)) => Err(CloseReason::Protocol(e)),
            Err(error) => {
                tracing::warn!(
                    peer = %self.peer,
                    opaque = header.opaque,
                    message_type = ?header.message_type,
                    "undecodable message: {error}"
                );
                match self.endpoint.on_undecodable(header, error) {
                    Some(reply) => self.send(reply).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn on_tick(&mut self) -> Step {
        let now = Instant::now();
        self.endpoint.on_tick(now);
        let flow = self.pipeline.tick(now);
        self.apply(flow).await
    }

    /// Send an application message down the pipeline.
    async fn send(&mut self, message: Message) -> Step {
        let flow = self.pipeline.outbound(message, Instant::now());
        self.apply(flow).await
    }

    async fn apply(&mut self, flow: Flow) -> Step {
        let Flow {
            deliver,
            writes,
            close,
        } = flow;
        for message in writes {
            self.write(message).await?;
        }
        if let Some(message) = deliver {
            self.endpoint.on_message(message).await;
        }
        match close {
            Some(reason) => Err(CloseReason::Requested(reason)),
            None => Ok(()),
        }
    }

    async fn write(&mut self, message: Message) -> Step {
        let packet = match self.encode(&message) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::warn!(
                    peer = %self.peer,
                    opaque = message.opaque(),
                    "failed to encode outgoing message: {error}"
                );
                let Some(fallback) = self.endpoint.on_encode_failed(message, error) else {
                    return Ok(());
                };
                match self.encode(&fallback) {
                    Ok(packet) => packet,
                    Err(error) => {
                        tracing::warn!(peer = %self.peer, "dropping unencodable message: {error}");
                        return Ok(());
                    }
                }
            }
        };
        self.writer.send(packet).await.map_err(CloseReason::Write)
    }

    fn encode(&self, message: &Message) -> Result<Packet, CodecError> {
        let packet = self.codec.encode(message)?;
        let max = self.writer.encoder().max_frame_size();
        if packet.body.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                len: packet.body.len(),
                max,
            }
            .into());
        }
        Ok(packet)
    }

    /// Stop reading, let the endpoint's in-flight work finish, and flush
    /// whatever it produced.
    async fn drain(&mut self) -> CloseReason {
        let Some(tracker) = self.endpoint.begin_shutdown() else {
            return CloseReason::Shutdown;
        };
        tracker.close();
        tracing::debug!(peer = %self.peer, in_flight = tracker.len(), "draining connection");

        loop {
            let step = tokio::select! {
                biased;
                Some(message) = self.outbound.recv() => self.send(message).await,
                _ = tracker.wait() => break,
            };
            if let Err(reason) = step {
                return reason;
            }
        }
        while let Ok(message) = self.outbound.try_recv() {
            if let Err(reason) = self.send(message).await {
                return reason;
            }
        }
        CloseReason::Shutdown
    }
}
