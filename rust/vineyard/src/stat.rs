//! Call instrumentation.
//!
//! [`StatStage`] watches requests and responses go by and reports one
//! [`CallRecord`] per call to a [`StatsSink`]. On a server it times the
//! dispatch (inbound request to outbound response); on a client it times
//! the round trip (outbound request to inbound response).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use vineyard_wire::{ErrorKind, Message, Response};

use crate::heartbeat::Role;
use crate::pipeline::{Stage, StageContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failed(ErrorKind),
    /// Client only: no response before the caller's deadline.
    TimedOut,
    /// The connection closed with the call still open.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub role: Role,
    pub opaque: i32,
    pub bean: String,
    pub method: String,
    pub latency: Duration,
    pub outcome: CallOutcome,
}

pub trait StatsSink: Send + Sync + 'static {
    fn record(&self, record: &CallRecord);
}

/// Counters over every recorded call.
#[derive(Debug, Default)]
pub struct CallStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    abandoned: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallStatsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub abandoned: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl CallStatsSnapshot {
    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_latency / calls,
            Err(_) => Duration::from_micros(
                (self.total_latency.as_micros() / u128::from(self.calls)) as u64,
            ),
        }
    }
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed)),
            max_latency: Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed)),
        }
    }
}

impl StatsSink for CallStats {
    fn record(&self, record: &CallRecord) {
        let micros = u64::try_from(record.latency.as_micros()).unwrap_or(u64::MAX);
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
        let counter = match record.outcome {
            CallOutcome::Success => &self.successes,
            CallOutcome::Failed(_) => &self.failures,
            CallOutcome::TimedOut => &self.timeouts,
            CallOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct InFlight {
    started: Instant,
    deadline: Option<Instant>,
    bean: String,
    method: String,
}

pub struct StatStage {
    role: Role,
    sink: Arc<dyn StatsSink>,
    in_flight: HashMap<i32, InFlight>,
}

impl StatStage {
    pub fn new(role: Role, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            role,
            sink,
            in_flight: HashMap::new(),
        }
    }

    /// A factory for [`PipelineBuilder`](crate::PipelineBuilder).
    pub fn factory(role: Role, sink: Arc<dyn StatsSink>) -> impl Fn() -> StatStage + Send + Sync + 'static {
        move || StatStage::new(role, Arc::clone(&sink))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn start(&mut self, message: &Message, now: Instant) {
        let Message::Request(m) = message else {
            return;
        };
        // Servers answer late requests anyway; only clients give up.
        let deadline = match self.role {
            Role::Client if m.request.timeout > 0 => {
                Some(now + Duration::from_millis(m.request.timeout as u64))
            }
            _ => None,
        };
        self.in_flight.insert(
            m.request.opaque,
            InFlight {
                started: now,
                deadline,
                bean: m.request.bean_name.clone(),
                method: m.request.method_name.clone(),
            },
        );
    }

    fn finish(&mut self, message: &Message, now: Instant) {
        let Message::Response(m) = message else {
            return;
        };
        let Some(call) = self.in_flight.remove(&m.response.opaque) else {
            return;
        };
        // Past the deadline the caller has already been told it timed out.
        let outcome = match call.deadline {
            Some(deadline) if deadline <= now => CallOutcome::TimedOut,
            _ => outcome_of(&m.response),
        };
        self.emit(m.response.opaque, call, now, outcome);
    }

    fn emit(&self, opaque: i32, call: InFlight, now: Instant, outcome: CallOutcome) {
        let record = CallRecord {
            role: self.role,
            opaque,
            bean: call.bean,
            method: call.method,
            latency: now.saturating_duration_since(call.started),
            outcome,
        };
        tracing::debug!(
            role = ?record.role,
            opaque,
            bean = %record.bean,
            method = %record.method,
            latency_us = record.latency.as_micros() as u64,
            outcome = ?record.outcome,
            "call finished"
        );
        self.sink.record(&record);
    }
}

fn outcome_of(response: &Response) -> CallOutcome {
    match &response.outcome {
        Ok(_) => CallOutcome::Success,
        Err(e) => CallOutcome::Failed(e.kind),
    }
}

impl Stage for StatStage {
    fn name(&self) -> &'static str {
        "stat"
    }

    fn inbound(&mut self, message: Message, ctx: &mut StageContext) -> Option<Message> {
        match self.role {
            Role::Server => self.start(&message, ctx.now()),
            Role::Client => self.finish(&message, ctx.now()),
        }
        Some(message)
    }

    fn outbound(&mut self, message: Message, ctx: &mut StageContext) -> Option<Message> {
        match self.role {
            Role::Server => self.finish(&message, ctx.now()),
            Role::Client => self.start(&message, ctx.now()),
        }
        Some(message)
    }

    fn on_tick(&mut self, ctx: &mut StageContext) {
        let now = ctx.now();
        let expired: Vec<i32> = self
            .in_flight
            .iter()
            .filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
            .map(|(opaque, _)| *opaque)
            .collect();
        for opaque in expired {
            if let Some(call) = self.in_flight.remove(&opaque) {
                self.emit(opaque, call, now, CallOutcome::TimedOut);
            }
        }
    }

    fn on_close(&mut self, ctx: &mut StageContext) {
        let now = ctx.now();
        for (opaque, call) in std::mem::take(&mut self.in_flight) {
            self.emit(opaque, call, now, CallOutcome::Abandoned);
        }
    }
}
