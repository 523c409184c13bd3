//! vineyard-calc: a calculator service, and a client to poke any vineyard
//! server from the command line.
//!
//! # Usage
//!
//! ```bash
//! vineyard-calc serve --addr 127.0.0.1:7070
//! vineyard-calc call --addr 127.0.0.1:7070 Calc add 2 3
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vineyard::{Config, Server, Service, ServiceBuilder, ServiceRegistry, Value};

#[derive(Parser, Debug)]
#[command(name = "vineyard-calc")]
#[command(about = "Calculator service over vineyard RPC")]
struct Args {
    /// TOML config file; `VINEYARD_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the `Calc` service until Ctrl-C
    Serve {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: SocketAddr,
    },
    /// Make one call and print the result
    Call {
        #[arg(long, default_value = "127.0.0.1:7070")]
        addr: SocketAddr,
        /// Call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        bean: String,
        method: String,
        /// Arguments: integers, floats, true/false, null, or strings
        args: Vec<String>,
    },
}

struct Calc;

impl Service for Calc {
    fn methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        builder
            .method("add", |_: &Calc, a: i64, b: i64| {
                a.checked_add(b).ok_or("integer overflow")
            })
            .method("add", |_: &Calc, a: f64, b: f64| a + b)
            .method("sub", |_: &Calc, a: i64, b: i64| {
                a.checked_sub(b).ok_or("integer overflow")
            })
            .method("sub", |_: &Calc, a: f64, b: f64| a - b)
            .method("mul", |_: &Calc, a: i64, b: i64| {
                a.checked_mul(b).ok_or("integer overflow")
            })
            .method("mul", |_: &Calc, a: f64, b: f64| a * b)
            .method("div", |_: &Calc, a: i64, b: i64| {
                a.checked_div(b).ok_or("division by zero")
            })
            .method("div", |_: &Calc, a: f64, b: f64| a / b)
            .method("echo", |_: &Calc, v: Value| v)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Serve { addr } => serve(addr, config).await,
        Command::Call {
            addr,
            timeout_ms,
            bean,
            method,
            args,
        } => {
            let args = args.iter().map(|a| parse_arg(a)).collect();
            let timeout = timeout_ms.map(Duration::from_millis);
            call(addr, config, &bean, &method, args, timeout).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, vineyard::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn serve(addr: SocketAddr, config: Config) -> ExitCode {
    let mut registry = ServiceRegistry::new();
    if let Err(e) = registry.register_service("Calc", Calc) {
        tracing::error!("failed to register Calc: {e}");
        return ExitCode::FAILURE;
    }

    let server = match Server::serve(addr, registry, config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {e}");
    }
    let stats = server.stats().snapshot();
    server.stop().await;
    tracing::info!(
        calls = stats.calls,
        failures = stats.failures,
        mean_latency_us = stats.mean_latency().as_micros() as u64,
        "bye"
    );
    ExitCode::SUCCESS
}

async fn call(
    addr: SocketAddr,
    config: Config,
    bean: &str,
    method: &str,
    args: Vec<Value>,
    timeout: Option<Duration>,
) -> ExitCode {
    let client = match vineyard::Client::connect([addr], config).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(%addr, "failed to connect: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = client.call(bean, method, args, timeout).await;
    client.close().await;

    match result {
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{bean}.{method} failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn parse_arg(arg: &str) -> Value {
    if let Ok(i) = arg.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = arg.parse::<f64>() {
        return Value::Float(f);
    }
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::Str(arg.to_owned()),
    }
}
