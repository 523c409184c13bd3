//! Connection liveness.
//!
//! [`HeartbeatState`] is a pure state machine driven by two events: "a
//! frame arrived" and "the timer ticked". It never touches the socket; the
//! [`HeartbeatStage`] turns its decisions into PING/PONG messages and close
//! requests inside a connection's pipeline.
//!
//! ```text
//! ACTIVE --idle window--> SUSPECT --grace window--> CLOSING --> CLOSED
//!    ^                       |
//!    +-------- frame --------+
//! ```

use std::time::Duration;

use tokio::time::Instant;
use vineyard_wire::Message;

use crate::pipeline::{Stage, StageContext};

/// Which end of the connection we are. Only clients originate pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Suspect,
    Closing,
    Closed,
}

/// What the connection should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    SendPing,
    Close,
}

#[derive(Debug, Clone)]
pub struct HeartbeatState {
    role: Role,
    idle_window: Duration,
    grace_window: Duration,
    last_received_at: Instant,
    missed_count: u32,
    phase: Phase,
}

impl HeartbeatState {
    pub fn new(role: Role, idle_window: Duration, grace_window: Duration, now: Instant) -> Self {
        Self {
            role,
            idle_window,
            grace_window,
            last_received_at: now,
            missed_count: 0,
            phase: Phase::Active,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn missed_count(&self) -> u32 {
        self.missed_count
    }

    pub fn last_received_at(&self) -> Instant {
        self.last_received_at
    }

    /// Any inbound frame proves the peer alive.
    pub fn on_frame_received(&mut self, now: Instant) {
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            return;
        }
        if self.phase == Phase::Suspect {
            tracing::debug!(role = ?self.role, "peer answered, connection active again");
        }
        self.last_received_at = now;
        self.missed_count = 0;
        self.phase = Phase::Active;
    }

    /// Advance on a timer tick.
    ///
    /// Both windows are measured from the last frame received, so a silent
    /// peer is closed on the first tick at or after `idle + grace`.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            return HeartbeatAction::None;
        }
        let silent = now.saturating_duration_since(self.last_received_at);
        if silent >= self.idle_window.saturating_add(self.grace_window) {
            self.phase = Phase::Closing;
            tracing::debug!(role = ?self.role, ?silent, "grace window elapsed, closing");
            return HeartbeatAction::Close;
        }
        if self.phase == Phase::Suspect || silent < self.idle_window {
            return HeartbeatAction::None;
        }

        self.phase = Phase::Suspect;
        self.missed_count += 1;
        tracing::debug!(
            role = ?self.role,
            missed = self.missed_count,
            "connection idle, now suspect"
        );
        match self.role {
            Role::Client => HeartbeatAction::SendPing,
            Role::Server => HeartbeatAction::None,
        }
    }

    /// The connection has been torn down.
    pub fn on_closed(&mut self) {
        self.phase = Phase::Closed;
    }
}

/// Pipeline stage answering pings and policing idle connections.
///
/// PING and PONG stop here; they never reach the dispatcher or the
/// correlation table.
pub struct HeartbeatStage {
    state: HeartbeatState,
    magic: u8,
    serializer_type: u8,
}

impl HeartbeatStage {
    pub fn new(state: HeartbeatState, magic: u8, serializer_type: u8) -> Self {
        Self {
            state,
            magic,
            serializer_type,
        }
    }

    pub fn state(&self) -> &HeartbeatState {
        &self.state
    }
}

impl Stage for HeartbeatStage {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn on_frame(&mut self, ctx: &mut StageContext) {
        self.state.on_frame_received(ctx.now());
    }

    fn inbound(&mut self, message: Message, ctx: &mut StageContext) -> Option<Message> {
        match message {
            Message::Ping(header) => {
                ctx.write(Message::pong(self.magic, header.serializer_type));
                None
            }
            Message::Pong(_) => None,
            other => Some(other),
        }
    }

    fn on_tick(&mut self, ctx: &mut StageContext) {
        match self.state.on_tick(ctx.now()) {
            HeartbeatAction::None => {}
            HeartbeatAction::SendPing => {
                ctx.write(Message::ping(self.magic, self.serializer_type));
            }
            HeartbeatAction::Close => ctx.close("heartbeat timeout"),
        }
    }

    fn on_close(&mut self, _ctx: &mut StageContext) {
        self.state.on_closed();
    }
}
