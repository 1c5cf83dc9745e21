//! palaver-relay: the presence-and-routing relay server.
//!
//! Accepts WebSocket connections at `/ws/{user_id}`, tracks presence, and
//! fans chat messages, typing signals, read receipts, and deletions out to
//! private and group rooms.  Best-effort only — clients reconcile against
//! their own history fetches for durability.

use std::time::Duration;

use clap::Parser;
use tokio::sync::oneshot;

use palaver::relay::{app, RelayConfig, RelayState};
use palaver::plog;

/// Relay server for the palaver chat system.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "palaver-relay", version, about)]
struct Cli {
    /// Bind address for the WebSocket/HTTP listener
    #[arg(long, short = 'b', env = "PALAVER_BIND", default_value = "127.0.0.1:3001")]
    bind: String,

    /// Seconds between periodic presence summary log lines (0 disables)
    #[arg(long, env = "PALAVER_PEER_LOG_SECS", default_value_t = 60)]
    peer_log_secs: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    palaver::logging::init();

    plog!("palaver-relay starting");
    plog!("  bind address: {}", cli.bind);

    let config = RelayConfig {
        peer_log_interval: Duration::from_secs(cli.peer_log_secs),
        log_sink: None,
    };
    let state = RelayState::new(config);

    let (_shutdown_tx, shutdown_rx) = oneshot::channel();
    state.start_peer_log_task(shutdown_rx);

    let router = app(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .expect("failed to bind");
    plog!("palaver-relay listening on http://{}", cli.bind);

    axum::serve(listener, router).await.expect("server error");
}
