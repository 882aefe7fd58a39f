//! linerpc - issue one JSON-RPC call from the command line.
//!
//! ```text
//! linerpc <address> <method> [params-json]
//! ```
//!
//! `address` is `host:port` for TCP or `unix:/path/to.sock`. `params-json`
//! defaults to `[]`. Notifications received while waiting are logged.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linerpc::{Client, ClientConfig, Notifications};

const USAGE: &str = "usage: linerpc <address> <method> [params-json]";

/// Where to connect.
#[derive(Debug, PartialEq)]
enum Address {
    Tcp(String),
    Unix(PathBuf),
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    address: Address,
    method: String,
    params: Value,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let (address, method, params) = match args {
        [address, method] => (address, method, None),
        [address, method, params] => (address, method, Some(params)),
        _ => bail!(USAGE),
    };

    let address = match address.strip_prefix("unix:") {
        Some(path) => Address::Unix(PathBuf::from(path)),
        None => Address::Tcp(address.clone()),
    };

    let params = match params {
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("Invalid params JSON: {}", raw))?,
        None => Value::Array(Vec::new()),
    };
    if !params.is_array() && !params.is_object() {
        bail!("params must be a JSON array or object");
    }

    Ok(CliArgs {
        address,
        method: method.clone(),
        params,
    })
}

async fn connect(
    address: &Address,
    notifications: Notifications,
    config: ClientConfig,
) -> Result<Client> {
    let client = match address {
        Address::Tcp(addr) => Client::dial(addr.as_str(), notifications, config)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?,
        #[cfg(unix)]
        Address::Unix(path) => Client::dial_unix(path, notifications, config)
            .await
            .with_context(|| format!("Failed to connect to {}", path.display()))?,
        #[cfg(not(unix))]
        Address::Unix(_) => bail!("unix sockets are not supported on this platform"),
    };
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "linerpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;
    let config = ClientConfig::from_env().context("Invalid configuration")?;

    info!("Starting linerpc v{}", env!("CARGO_PKG_VERSION"));

    let (notifications, mut messages, mut errors) = Notifications::channels(64);
    let client = connect(&args.address, notifications, config).await?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(message) = messages.recv() => {
                    info!(method = %message.method, params = ?message.params, "Notification");
                }
                Some(error) = errors.recv() => {
                    warn!("{}", error);
                }
                else => break,
            }
        }
    });

    let result: Value = client
        .request(&args.method, args.params)
        .await
        .with_context(|| format!("Call to {} failed", args.method))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Err(e) = client.close().await {
        warn!("Failed to close connection: {}", e);
    }
    Ok(())
}
