use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use whorl::{BlocklistGuard, ModerationGuard, Relay, RelayConfig, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "whorl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address. When omitted, listens on 0.0.0.0 with the port taken
    /// from $PORT (default 3000).
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Comma-separated blocklist enabling the moderation guard.
    #[arg(long, env = "WHORL_BLOCKLIST")]
    blocklist: Option<String>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = RelayConfig::from_env();
    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.port)));

    let guard: Option<Arc<dyn ModerationGuard>> = args.blocklist.map(|raw| {
        let terms: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        info!(terms = terms.len(), "moderation guard enabled");
        Arc::new(BlocklistGuard::new(terms)) as Arc<dyn ModerationGuard>
    });

    let transport = WsTransport::new(config.clone());
    let relay = Relay::spawn(transport.clone(), &config, guard);
    let (addr, _listener) = transport.bind(bind, relay.clone()).await?;

    info!(addr = %addr, "whorl relay live");

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));
    interval.tick().await; // Skip initial tick

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = relay.telemetry().await;
                info!(
                    sessions = snapshot.sessions,
                    worlds = snapshot.worlds,
                    rate_tracked = snapshot.rate_tracked,
                    "telemetry snapshot"
                );
            }
        }
    }

    Ok(())
}
