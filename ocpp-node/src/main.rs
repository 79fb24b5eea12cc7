//! OCPP Node - CLI for the OCPP adapter
//!
//! Runs one networking node with a WebSocket uplink to the CSMS, periodic
//! heartbeats and a minimal handler for inbound requests.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! ocpp-node --station CS001
//!
//! # Connect to specific CSMS
//! ocpp-node --station CS001 \
//!     --ocpp-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Heartbeat every minute, 10 s request timeout
//! ocpp-node --station CS001 --heartbeat-secs 60 --request-timeout-secs 10
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_adapter::ws::{WebSocketClientConfig, WebSocketClientTransport};
use ocpp_adapter::{
    spawn_heartbeats, AdapterConfig, AnyEnvelope, BinaryRequestError, ErrorCode, IncomingMessage,
    JsonRequestError, NodeId, OcppAdapter, Reachability, StaticRoutingTable, UnsolicitedError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OCPP station ID (also the node id)
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// OCPP CSMS WebSocket URL
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    ocpp_url: String,

    /// Node id of the CSMS
    #[arg(long, default_value = "CSMS")]
    csms_node: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "300")]
    heartbeat_secs: u64,

    /// Disable heartbeats
    #[arg(long)]
    no_heartbeats: bool,

    /// Default request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                OCPP Node - Networking Node                   ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:   {:<49} ║", args.station);
    println!("║  CSMS:      {:<49} ║", args.csms_node);
    println!("║  OCPP URL:  {:<49} ║", truncate(&args.ocpp_url, 49));
    println!("║  Heartbeat: {:<49} ║", heartbeat_label(&args));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Uplink to the CSMS doubles as the default route
    let uplink = WebSocketClientTransport::new(WebSocketClientConfig {
        csms_url: args.ocpp_url.clone(),
        station_id: args.station.clone(),
        remote_node: NodeId::new(args.csms_node.as_str()),
        ..Default::default()
    });
    let routing = Arc::new(StaticRoutingTable::new());
    routing.register_client(args.csms_node.as_str(), uplink.clone());
    routing.set_default_route(Some(Reachability::Client(uplink.clone())));

    // Build configuration
    let mut config = AdapterConfig::new(args.station.as_str())
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_heartbeats(args.csms_node.as_str(), Duration::from_secs(args.heartbeat_secs));
    if args.no_heartbeats {
        config = config.without_heartbeats();
    }

    let (adapter, channels) = OcppAdapter::new(config, routing)?;
    let adapter = Arc::new(adapter);
    let shutdown = CancellationToken::new();

    info!("Starting OCPP node...");

    let transport = tokio::spawn(uplink.run(adapter.clone(), shutdown.clone()));
    let heartbeats = spawn_heartbeats(adapter.clone(), shutdown.clone());
    tokio::spawn(handle_incoming(adapter.clone(), channels.incoming));
    tokio::spawn(log_unsolicited(channels.unsolicited_errors));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    if let Some(heartbeats) = heartbeats {
        let _ = heartbeats.await;
    }
    match transport.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Transport stopped: {}", e),
        Err(e) => error!("Transport task failed: {}", e),
    }

    Ok(())
}

/// Answer every inbound request with `NotImplemented`.
/// One-way messages are only logged.
async fn handle_incoming(adapter: Arc<OcppAdapter>, mut incoming: mpsc::Receiver<IncomingMessage>) {
    while let Some(IncomingMessage { envelope, connection }) = incoming.recv().await {
        let result = match envelope {
            AnyEnvelope::JsonRequest(request) => {
                info!(
                    "{} request {} from {}",
                    request.action, request.header.request_id, connection.connection_id
                );
                let error = JsonRequestError::for_request(
                    &request,
                    adapter.node_id().clone(),
                    ErrorCode::NotImplemented,
                    format!("{} is not supported by this node", request.action),
                );
                adapter.send_json_request_error(&error).await
            }
            AnyEnvelope::BinaryRequest(request) => {
                info!(
                    "Binary {} request {} from {}",
                    request.action, request.header.request_id, connection.connection_id
                );
                let error = BinaryRequestError::for_request(
                    &request,
                    adapter.node_id().clone(),
                    ErrorCode::NotImplemented,
                    format!("{} is not supported by this node", request.action),
                );
                adapter.send_binary_request_error(&error).await
            }
            other => {
                debug!("Ignoring {} {}", other.kind(), other.request_id());
                continue;
            }
        };

        if !result.is_success() {
            warn!("Could not answer request: {}", result);
        }
    }
}

async fn log_unsolicited(mut errors: mpsc::Receiver<UnsolicitedError>) {
    while let Some(unsolicited) = errors.recv().await {
        warn!(
            "Unsolicited {} {} on {}",
            unsolicited.envelope.kind(),
            unsolicited.envelope.request_id(),
            unsolicited.connection.connection_id
        );
    }
}

fn heartbeat_label(args: &Args) -> String {
    if args.no_heartbeats {
        "disabled".to_string()
    } else {
        format!("every {} s", args.heartbeat_secs)
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    // Counted in chars: the banner pads by chars and URLs may hold non-ASCII
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
