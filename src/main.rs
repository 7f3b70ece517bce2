//! Crash Round Server
//!
//! Serves crash rounds over WebSocket until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crash_round::{
    engine::{services::STARTING_BALANCE, EngineConfig, InMemoryLedger, RemoteLedger, Services},
    network::{GameServer, ServerConfig},
    VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "crash-round-server")]
#[command(about = "Crash betting round server", long_about = None)]
struct Args {
    /// Bind address (overrides CRASH_BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// REST ledger base URL (overrides CRASH_LEDGER_URL)
    #[arg(long)]
    ledger_url: Option<String>,

    /// Use the in-memory ledger even if a ledger URL is configured
    #[arg(long)]
    offline: bool,

    /// Opening balance for in-memory accounts
    #[arg(long, default_value_t = STARTING_BALANCE)]
    demo_balance: u64,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Timeout for ledger calls in milliseconds
    #[arg(long)]
    service_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(url) = args.ledger_url {
        config.ledger_url = Some(url);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }

    let mut engine_config = EngineConfig::from_env();
    if let Some(ms) = args.service_timeout_ms {
        engine_config.service_timeout = Duration::from_millis(ms);
    }

    info!("Crash Round Server v{}", VERSION);
    info!(
        "Countdown {}s, active tick {:?}, cooldown {:?}, min bet {}",
        engine_config.countdown_secs,
        engine_config.clock.active_period,
        engine_config.clock.cooldown,
        engine_config.min_bet
    );

    let timeout = engine_config.service_timeout;
    let services = match config.ledger_url.as_deref() {
        Some(url) if !args.offline => {
            info!("Using REST ledger at {}", url);
            let ledger = RemoteLedger::new(url, timeout).context("building ledger client")?;
            Services::from_ledger(Arc::new(ledger), timeout)
        }
        _ => {
            warn!("Using in-memory ledger; balances are lost on exit");
            let ledger = InMemoryLedger::with_opening_balance(args.demo_balance);
            Services::from_ledger(Arc::new(ledger), timeout)
        }
    };

    let server = Arc::new(
        GameServer::new(config, engine_config, services).context("invalid configuration")?,
    );

    let running = server.clone();
    let mut serve = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut serve => {
            // Server stopped on its own, e.g. the bind failed
            result.context("server task panicked")??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
        }
    }

    info!("Ctrl-C received, shutting down");
    server.shutdown();
    serve.await.context("server task panicked")??;
    info!("Server stopped");
    Ok(())
}
