//! eventbus-tail - subscribe to event bus addresses and print what arrives.
//!
//! Every message is written to stdout as one JSON line; logs go to stderr.
//!
//! ```text
//! eventbus-tail test.time test.echo.responses
//! eventbus-tail --publish test.echo '{"foo":"bar"}'
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eventbus_bridge::bus::{BusError, EventBus, Headers, Message};
use eventbus_bridge::config::BusConfig;

#[derive(Debug, Parser)]
#[command(name = "eventbus-tail", version, about = "Tail event bus bridge addresses")]
struct Cli {
    /// Addresses to register and print messages for
    addresses: Vec<String>,

    /// Bridge host (overrides config and EVENTBUS_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bridge port (overrides config and EVENTBUS_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// JSON config file (default: platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Publish one JSON body to ADDRESS and exit
    #[arg(long, num_args = 2, value_names = ["ADDRESS", "JSON"])]
    publish: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "eventbus_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::info!(
        "Starting eventbus-tail v{} against {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );

    let bus = EventBus::with_config(config);

    if let Some(publish) = &cli.publish {
        return publish_once(&bus, &publish[0], &publish[1]).await;
    }

    if cli.addresses.is_empty() {
        bail!("No addresses given; pass at least one address to tail");
    }

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<BusError>();
    bus.set_error_handler(move |err| {
        tracing::error!("Event bus error: {}", err);
        if err.is_disconnect() {
            let _ = fatal_tx.send(err);
        }
    });

    bus.connect().await.context("Failed to connect to bridge")?;

    for address in &cli.addresses {
        bus.register(address, None, &Headers::new(), print_message)
            .await
            .with_context(|| format!("Failed to register {}", address))?;
        tracing::info!("Tailing {}", address);
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, disconnecting");
            Ok(())
        }
        Some(err) = fatal_rx.recv() => Err(anyhow::Error::new(err).context("Lost connection to bridge")),
    };

    bus.disconnect().await;
    result
}

/// Merge CLI flags over the resolved configuration.
fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = match &cli.config {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::resolve()?,
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn publish_once(bus: &EventBus, address: &str, body: &str) -> Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(body).with_context(|| format!("Invalid JSON body: {}", body))?;

    bus.connect().await.context("Failed to connect to bridge")?;
    let result = bus.publish(address, &body, &Headers::new()).await;
    bus.disconnect().await;

    result.with_context(|| format!("Failed to publish to {}", address))?;
    tracing::info!("Published to {}", address);
    Ok(())
}

fn print_message(message: Message) {
    let line = json!({
        "address": message.address(),
        "headers": message.headers(),
        "body": message.body(),
        "send": message.is_send(),
    });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = writeln!(out, "{}", line) {
        tracing::warn!("Failed to write message to stdout: {}", e);
    }
}
