//! Per-connection message pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s over decoded [`Message`]s.
//! Index 0 faces the application; the last stage faces the codecs:
//!
//! ```text
//! application ⇄ [stage 0] ⇄ ... ⇄ [stage n-1] ⇄ message codec ⇄ packet codec ⇄ socket
//! ```
//!
//! Inbound messages visit stages last-to-first, outbound messages
//! first-to-last. A stage can pass a message on, swallow it, write a new
//! message toward the wire (it then visits only the stages below the
//! writer), or ask for the connection to close.

use std::sync::Arc;

use tokio::time::Instant;
use vineyard_wire::Message;

use crate::Config;
use crate::heartbeat::{HeartbeatStage, HeartbeatState, Role};

pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    /// A frame was read off the wire, before it is decoded.
    fn on_frame(&mut self, _ctx: &mut StageContext) {}

    fn inbound(&mut self, message: Message, _ctx: &mut StageContext) -> Option<Message> {
        Some(message)
    }

    fn outbound(&mut self, message: Message, _ctx: &mut StageContext) -> Option<Message> {
        Some(message)
    }

    /// Periodic timer.
    fn on_tick(&mut self, _ctx: &mut StageContext) {}

    /// The connection is going away. Writes made here are dropped.
    fn on_close(&mut self, _ctx: &mut StageContext) {}
}

/// What a stage may do besides returning a message.
#[derive(Debug)]
pub struct StageContext {
    now: Instant,
    writes: Vec<Message>,
    close: Option<String>,
}

impl StageContext {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            writes: Vec::new(),
            close: None,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue a message toward the wire.
    pub fn write(&mut self, message: Message) {
        self.writes.push(message);
    }

    /// Ask the connection to close. The first reason wins.
    pub fn close(&mut self, reason: impl Into<String>) {
        self.close.get_or_insert_with(|| reason.into());
    }

    pub fn take_writes(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.writes)
    }

    pub fn close_requested(&self) -> Option<&str> {
        self.close.as_deref()
    }
}

/// The result of pushing one event through a pipeline.
#[derive(Debug, Default, PartialEq)]
pub struct Flow {
    /// Message that came out of the application end.
    pub deliver: Option<Message>,
    /// Messages that came out of the wire end, in order.
    pub writes: Vec<Message>,
    pub close: Option<String>,
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn frame_received(&mut self, now: Instant) -> Flow {
        let mut flow = Flow::default();
        for i in 0..self.stages.len() {
            let mut ctx = StageContext::new(now);
            self.stages[i].on_frame(&mut ctx);
            self.absorb(i, ctx, &mut flow);
        }
        flow
    }

    pub fn inbound(&mut self, message: Message, now: Instant) -> Flow {
        let mut flow = Flow::default();
        let mut current = Some(message);
        for i in (0..self.stages.len()).rev() {
            let Some(message) = current.take() else {
                break;
            };
            let mut ctx = StageContext::new(now);
            current = self.stages[i].inbound(message, &mut ctx);
            self.absorb(i, ctx, &mut flow);
        }
        flow.deliver = current;
        flow
    }

    pub fn outbound(&mut self, message: Message, now: Instant) -> Flow {
        let mut flow = Flow::default();
        self.run_outbound(0, message, now, &mut flow);
        flow
    }

    pub fn tick(&mut self, now: Instant) -> Flow {
        let mut flow = Flow::default();
        for i in 0..self.stages.len() {
            let mut ctx = StageContext::new(now);
            self.stages[i].on_tick(&mut ctx);
            self.absorb(i, ctx, &mut flow);
        }
        flow
    }

    pub fn close(&mut self, now: Instant) {
        for stage in &mut self.stages {
            stage.on_close(&mut StageContext::new(now));
        }
    }

    fn run_outbound(&mut self, from: usize, message: Message, now: Instant, flow: &mut Flow) {
        let mut current = Some(message);
        for i in from..self.stages.len() {
            let Some(message) = current.take() else {
                return;
            };
            let mut ctx = StageContext::new(now);
            current = self.stages[i].outbound(message, &mut ctx);
            self.absorb(i, ctx, flow);
        }
        if let Some(message) = current {
            flow.writes.push(message);
        }
    }

    /// Route what stage `index` asked for into `flow`.
    fn absorb(&mut self, index: usize, ctx: StageContext, flow: &mut Flow) {
        let StageContext { now, writes, close } = ctx;
        if let Some(reason) = close {
            flow.close.get_or_insert(reason);
        }
        for message in writes {
            self.run_outbound(index + 1, message, now, flow);
        }
    }
}

type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Describes a pipeline; every connection builds its own from it.
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    factories: Vec<StageFactory>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server chain: idle detection without originating pings.
    pub fn server(config: &Config) -> Self {
        Self::new().add_last(heartbeat_factory(Role::Server, config))
    }

    /// Client chain: pings an idle server, closes if it stays silent.
    pub fn client(config: &Config) -> Self {
        Self::new().add_last(heartbeat_factory(Role::Client, config))
    }

    /// Insert a stage at the application end.
    pub fn add_first<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stage,
    {
        self.factories.insert(0, boxed(factory));
        self
    }

    /// Insert a stage at the wire end.
    pub fn add_last<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stage,
    {
        self.factories.push(boxed(factory));
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn build(&self) -> Pipeline {
        Pipeline::new(self.factories.iter().map(|f| f()).collect())
    }
}

fn boxed<F, S>(factory: F) -> StageFactory
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stage,
{
    Arc::new(move || Box::new(factory()) as Box<dyn Stage>)
}

fn heartbeat_factory(role: Role, config: &Config) -> impl Fn() -> HeartbeatStage + Send + Sync + 'static {
    let idle = config.idle_window();
    let grace = config.grace_window();
    let magic = config.magic;
    let serializer = config.serializer;
    move || {
        let state = HeartbeatState::new(role, idle, grace, Instant::now());
        HeartbeatStage::new(state, magic, serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vineyard_wire::{PacketHeader, MessageType, Request, RequestMessage};

    /// Records every message it sees, tagged with its own label.
    struct Tap {
        label: &'static str,
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Stage for Tap {
        fn name(&self) -> &'static str {
            self.label
        }

        fn inbound(&mut self, message: Message, _ctx: &mut StageContext) -> Option<Message> {
            self.seen.lock().push(format!("{} in {:?}", self.label, message.message_type()));
            Some(message)
        }

        fn outbound(&mut self, message: Message, _ctx: &mut StageContext) -> Option<Message> {
            self.seen.lock().push(format!("{} out {:?}", self.label, message.message_type()));
            Some(message)
        }
    }

    /// Answers every request with a ping and swallows it.
    struct Bouncer;

    impl Stage for Bouncer {
        fn name(&self) -> &'static str {
            "bouncer"
        }

        fn inbound(&mut self, message: Message, ctx: &mut StageContext) -> Option<Message> {
            match message {
                Message::Request(_) => {
                    ctx.write(Message::ping(0x42, 1));
                    ctx.close("bounced");
                    None
                }
                other => Some(other),
            }
        }
    }

    fn request() -> Message {
        Message::Request(RequestMessage::new(0x42, 1, Request::new("Calc", "add", vec![])))
    }

    fn taps(seen: &Arc<parking_lot::Mutex<Vec<String>>>) -> PipelineBuilder {
        let a = Arc::clone(seen);
        let b = Arc::clone(seen);
        PipelineBuilder::new()
            .add_last(move || Tap { label: "b", seen: Arc::clone(&b) })
            .add_first(move || Tap { label: "a", seen: Arc::clone(&a) })
    }

    #[test]
    fn inbound_runs_last_to_first_and_outbound_first_to_last() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pipeline = taps(&seen).build();
        assert_eq!(pipeline.names(), vec!["a", "b"]);

        let now = Instant::now();
        let flow = pipeline.inbound(request(), now);
        assert_eq!(flow.deliver, Some(request()));

        let flow = pipeline.outbound(request(), now);
        assert_eq!(flow.writes, vec![request()]);

        assert_eq!(
            *seen.lock(),
            vec!["b in Request", "a in Request", "a out Request", "b out Request"]
        );
    }

    #[test]
    fn writes_from_a_stage_only_visit_stages_below_it() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let below = Arc::clone(&seen);
        let mut pipeline = taps(&seen)
            .add_last(|| Bouncer)
            .add_last(move || Tap { label: "c", seen: Arc::clone(&below) })
            .build();

        let flow = pipeline.inbound(request(), Instant::now());
        assert_eq!(flow.deliver, None);
        assert_eq!(flow.close.as_deref(), Some("bounced"));
        assert_eq!(flow.writes.len(), 1);
        assert_eq!(flow.writes[0].message_type(), MessageType::Ping);
        assert_eq!(*seen.lock(), vec!["c in Request", "c out Ping"]);
    }

    #[test]
    fn server_chain_answers_pings_without_delivering_them() {
        let mut pipeline = PipelineBuilder::server(&Config::default()).build();
        assert_eq!(pipeline.names(), vec!["heartbeat"]);

        let ping = Message::Ping(PacketHeader::heartbeat(0x42, MessageType::Ping, 2));
        let flow = pipeline.inbound(ping, Instant::now());
        assert_eq!(flow.deliver, None);
        assert_eq!(flow.writes, vec![Message::pong(0x42, 2)]);
    }

    #[test]
    fn client_chain_pings_after_the_idle_window() {
        let config = Config {
            idle_window_ms: 100,
            grace_window_ms: 50,
            ..Config::default()
        };
        let mut pipeline = PipelineBuilder::client(&config).build();
        let start = Instant::now();

        assert!(pipeline.tick(start).writes.is_empty());
        let flow = pipeline.tick(start + config.idle_window());
        assert_eq!(flow.writes.len(), 1);
        assert!(flow.writes[0].is_heartbeat());

        let flow = pipeline.tick(start + config.idle_window() + config.grace_window());
        assert_eq!(flow.close.as_deref(), Some("heartbeat timeout"));
    }
}
