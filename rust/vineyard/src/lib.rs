#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

mod client;
mod config;
mod connection;
mod correlation;
mod dispatch;
mod error;
mod heartbeat;
mod pipeline;
mod registry;
mod server;
mod stat;
mod value;

// Re-export the wire crate for callers that build messages by hand.
pub use vineyard_wire as wire;
pub use vineyard_wire::{
    DEFAULT_MAGIC, DEFAULT_MAX_FRAME_SIZE, Encoding, ErrorKind, Message, RemoteError, Request,
    Response, Value, ValueKind,
};

pub use client::{Client, call};
pub use config::Config;
pub use correlation::{CorrelationTable, MAX_CALL_TIMEOUT, ResponseHandle};
pub use dispatch::Dispatcher;
pub use error::{CallError, ConfigError, RegistryError, ServerError};
pub use heartbeat::{HeartbeatAction, HeartbeatStage, HeartbeatState, Phase, Role};
pub use pipeline::{Flow, Pipeline, PipelineBuilder, Stage, StageContext};
pub use registry::{Handler, MethodEntry, Service, ServiceBuilder, ServiceHandle, ServiceRegistry};
pub use server::{Server, ServerHandle};
pub use stat::{CallOutcome, CallRecord, CallStats, CallStatsSnapshot, StatStage, StatsSink};
pub use value::{ConversionError, FromValue, IntoOutcome, IntoValue, ParamKind};
