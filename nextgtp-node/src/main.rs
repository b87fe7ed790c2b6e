//! nextgtp node
//!
//! Binds a GTP connection from a YAML configuration, answers Echo Requests,
//! keeps paths to the configured peers alive and reports path events until
//! interrupted. On shutdown every kernel object the node created is removed.
//!
//! # Usage
//!
//! ```bash
//! gtp-node -c config/node.yaml
//! gtp-node -c config/node.yaml --ping 192.0.2.1:2123
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use nextgtp_codec::GtpMessage;
use nextgtp_common::{init_logging, init_logging_with_filter, load_conn_config, LogLevel};
use nextgtp_conn::{Conn, ConnError, PathEvent};

/// nextgtp node - GTP endpoint with path management
#[derive(Parser, Debug)]
#[command(name = "gtp-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the node configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: String,

    /// Send one Echo Request to this peer after startup
    #[arg(long = "ping", value_name = "ADDR")]
    ping: Option<SocketAddr>,

    /// Log level: trace, debug, info, warn or error (overridden by RUST_LOG)
    #[arg(long = "log-level", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Filter directives such as `info,nextgtp_conn::transaction=trace`; replaces --log-level
    #[arg(long = "log-filter", value_name = "DIRECTIVES")]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match &args.log_filter {
        Some(filter) => init_logging_with_filter(filter),
        None => init_logging(args.log_level),
    }

    match run_node(args).await {
        Ok(()) => {
            info!("node exited successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("node failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_node(args: Args) -> Result<()> {
    info!("Loading configuration from: {}", args.config_file);
    let config = load_conn_config(&args.config_file)
        .with_context(|| format!("Failed to load configuration from {}", args.config_file))?;

    let conn = Conn::bind(config)
        .await
        .context("Failed to bind GTP connection")?;
    info!(
        "{} node listening on {} (restart counter {})",
        conn.version(),
        conn.local_addr(),
        conn.restart_counter()
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.listen_and_serve(stop_rx).await })
    };

    if let Some(mut events) = conn.take_path_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_path_event(&event);
            }
        });
    }

    if let Some(peer) = args.ping {
        ping(&conn, peer).await;
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        result = server => {
            match result {
                Ok(Ok(())) => info!("receive loop ended"),
                Ok(Err(e)) => warn!("receive loop failed: {}", e),
                Err(e) => warn!("receive loop task failed: {}", e),
            }
        }
    }

    let _ = stop_tx.send(true);
    match conn.close().await {
        Ok(()) => info!("GTP connection closed cleanly"),
        Err(ConnError::Cleanup(cleanup)) => {
            for (object, e) in &cleanup.failures {
                error!("left behind {}: {}", object, e);
            }
            anyhow::bail!("{} kernel objects could not be removed", cleanup.len());
        }
        Err(e) => return Err(e).context("Failed to close GTP connection"),
    }
    Ok(())
}

async fn ping(conn: &Conn, peer: SocketAddr) {
    let echo = GtpMessage::echo_request(conn.version(), 0, conn.restart_counter());
    match conn.send_request(peer, echo).await {
        Ok(response) => info!(
            "Echo Response from {} (restart counter {:?}, {} retransmissions so far)",
            peer,
            response.recovery(),
            conn.retransmissions()
        ),
        Err(e) => warn!("Echo Request to {} failed: {}", peer, e),
    }
}

fn log_path_event(event: &PathEvent) {
    match event {
        PathEvent::PeerUp { peer } => info!("path to {} is up", peer),
        PathEvent::PathDown { peer, missed } => {
            warn!("path to {} is down after {} missed echoes", peer, missed)
        }
        PathEvent::PeerRestarted {
            peer,
            old_counter,
            new_counter,
            removed_tunnels,
            removed_sessions,
        } => warn!(
            "peer {} restarted ({} -> {}), removed {} tunnels and {} sessions",
            peer,
            old_counter,
            new_counter,
            removed_tunnels.len(),
            removed_sessions.len()
        ),
    }
}
