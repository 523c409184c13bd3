//! Runtime configuration.
//!
//! Everything here has a default, so an empty TOML document is a valid
//! config. Values are layered: defaults, then the file, then `VINEYARD_*`
//! environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vineyard_wire::{
    DEFAULT_MAGIC, DEFAULT_MAX_FRAME_SIZE, Encoding, MessageCodec, PacketCodec, SerializerRegistry,
};

use crate::ConfigError;

/// Shortest heartbeat/sweep tick the connection driver will use.
const MIN_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Magic byte expected at the start of every frame.
    pub magic: u8,
    /// Largest accepted body, in bytes.
    pub max_frame_size: usize,
    /// Serializer tag used for outgoing requests, and for error replies to
    /// requests whose serializer is unknown.
    pub serializer: u8,
    /// Silence after which a connection becomes suspect.
    pub idle_window_ms: u64,
    /// Further silence after which a suspect connection is closed.
    pub grace_window_ms: u64,
    /// Upper bound on concurrently running service invocations.
    pub max_concurrent_dispatch: usize,
    /// Client call timeout when the caller does not pass one.
    pub default_timeout_ms: u64,
    /// How often the client sweeps its pending calls for expired deadlines.
    pub sweep_interval_ms: u64,
    /// Capacity of each connection's outbound message queue.
    pub outbound_buffer: usize,

    /// Body serializers by tag. Code-only: not part of the file format.
    #[serde(skip)]
    pub serializers: SerializerRegistry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            serializer: Encoding::Postcard.as_u8(),
            idle_window_ms: 30_000,
            grace_window_ms: 10_000,
            max_concurrent_dispatch: 64,
            default_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            outbound_buffer: 256,
            serializers: SerializerRegistry::with_defaults(),
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Apply `VINEYARD_*` environment variables. Invalid values are logged
    /// and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_field(&lookup, "VINEYARD_MAGIC", &mut self.magic);
        override_field(&lookup, "VINEYARD_MAX_FRAME_SIZE", &mut self.max_frame_size);
        override_field(&lookup, "VINEYARD_IDLE_WINDOW_MS", &mut self.idle_window_ms);
        override_field(&lookup, "VINEYARD_GRACE_WINDOW_MS", &mut self.grace_window_ms);
        override_field(
            &lookup,
            "VINEYARD_MAX_CONCURRENT_DISPATCH",
            &mut self.max_concurrent_dispatch,
        );
        override_field(&lookup, "VINEYARD_DEFAULT_TIMEOUT_MS", &mut self.default_timeout_ms);
        override_field(&lookup, "VINEYARD_SWEEP_INTERVAL_MS", &mut self.sweep_interval_ms);
        override_field(&lookup, "VINEYARD_OUTBOUND_BUFFER", &mut self.outbound_buffer);

        // The serializer accepts either a tag or an encoding name.
        if let Some(raw) = lookup("VINEYARD_SERIALIZER") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                match trimmed
                    .parse::<u8>()
                    .ok()
                    .or_else(|| trimmed.parse::<Encoding>().ok().map(Encoding::as_u8))
                {
                    Some(tag) => self.serializer = tag,
                    None => tracing::warn!("invalid VINEYARD_SERIALIZER, ignoring: {trimmed:?}"),
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serializer == 0 {
            return Err(ConfigError::Invalid("serializer tag 0 is reserved".into()));
        }
        if !self.serializers.contains(self.serializer) {
            return Err(ConfigError::Invalid(format!(
                "no serializer registered for tag {}",
                self.serializer
            )));
        }
        if self.max_frame_size == 0 || self.max_frame_size > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be in 1..={}",
                i32::MAX
            )));
        }
        for (name, value) in [
            ("idle_window_ms", self.idle_window_ms),
            ("grace_window_ms", self.grace_window_ms),
            ("default_timeout_ms", self.default_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.default_timeout_ms > i32::MAX as u64 {
            return Err(ConfigError::Invalid(format!(
                "default_timeout_ms must be at most {}",
                i32::MAX
            )));
        }
        if self.max_concurrent_dispatch == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_dispatch must be positive".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Period of the connection driver's timer: a quarter of the shorter
    /// heartbeat window, never longer than the sweep interval.
    pub fn tick_interval(&self) -> Duration {
        let window = self.idle_window().min(self.grace_window()) / 4;
        window.min(self.sweep_interval()).max(MIN_TICK)
    }

    pub fn packet_codec(&self) -> PacketCodec {
        PacketCodec::new(self.magic, self.max_frame_size)
    }

    pub fn message_codec(&self) -> MessageCodec {
        MessageCodec::new(self.magic, self.serializers.clone())
    }
}

fn override_field<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    match trimmed.parse::<T>() {
        Ok(value) => *field = value,
        Err(err) => tracing::warn!("invalid {key}, ignoring: {err}"),
    }
}
