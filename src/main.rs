use anyhow::{Context, Result};
use clap::Parser;
use peer_session::transport::memory::MemoryNetwork;
use peer_session::transport::quic::IrohTransport;
use peer_session::{PeerRecord, PeerSession, SessionConfig, TransportConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "peer-session", about = "Serverless peer sessions over QUIC, bootstrapped by shareable tickets")]
struct Cli {
    /// User to log in as. The endpoint lives as long as this login.
    #[arg(long, default_value = "local")]
    user: String,

    /// Connect to a peer via its ticket.
    /// Can be specified multiple times.
    #[arg(long, short)]
    join: Vec<String>,

    /// Display name attached to sessions opened with --join.
    #[arg(long, default_value = "peer")]
    name: String,

    /// JSON settings file (scan_on_startup, live_sync, connect_timeout_secs).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Do not start the endpoint on login even if the settings allow it.
    /// The endpoint is then started explicitly before joining.
    #[arg(long)]
    no_auto_start: bool,

    /// Seconds to wait for a peer before giving up (overrides settings).
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Override iroh relay URLs. Can be specified multiple times.
    #[arg(long)]
    relay: Vec<String>,

    /// Bind QUIC to a fixed UDP port (for NAT port forwarding).
    #[arg(long)]
    bind_port: Option<u16>,

    /// Secret key file. Defaults to ~/.peer-session/key.
    #[arg(long, conflicts_with = "ephemeral")]
    key_file: Option<PathBuf>,

    /// Use a fresh identity for this run instead of the key file.
    #[arg(long)]
    ephemeral: bool,

    /// Seconds between liveness pings to known peers.
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Run two instances over an in-process network, exchange a ticket, and exit.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peer_session=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_settings(&cli).await?;

    if cli.simulate {
        return run_simulation(config).await;
    }

    let transport = IrohTransport::new(TransportConfig {
        key_path: if cli.ephemeral { None } else { cli.key_file.clone().or_else(TransportConfig::default_key_path) },
        relay_urls: cli.relay.clone(),
        bind_port: cli.bind_port,
        heartbeat_interval: cli.heartbeat.map(Duration::from_secs),
        ..TransportConfig::default()
    });
    let session = PeerSession::new(transport, config);

    let identity = match session.user_logged_in(&cli.user).await? {
        Some(id) => id,
        None => session.start_endpoint().await?,
    };
    eprintln!("Logged in as {} (node {identity})", cli.user);
    eprintln!("Ticket (share with a peer): {}", session.generate_ticket().await?);

    for ticket in &cli.join {
        match session.connect(ticket, &cli.name).await {
            Ok(peer) => eprintln!("Connected to {} ({:.1}ms)", peer.identity.fmt_short(), peer.round_trip_ms.unwrap_or_default()),
            Err(e) => tracing::warn!("Failed to join via ticket: {e}"),
        }
    }

    // Print the roster whenever it changes, until interrupted
    eprintln!("Running. Ctrl-C to stop.");
    let mut changes = session.subscribe_roster();
    loop {
        tokio::select! {
            res = changes.changed() => {
                if res.is_err() {
                    break;
                }
                print_roster(&session.get_roster().await);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    eprintln!("\nShutting down...");
    session.shutdown().await;
    Ok(())
}

async fn load_settings(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.settings {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid settings in {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if cli.no_auto_start {
        config.scan_on_startup = false;
        config.live_sync = false;
    }
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    Ok(config)
}

fn print_roster(peers: &[PeerRecord]) {
    if peers.is_empty() {
        eprintln!("Roster: (empty)");
        return;
    }
    eprintln!("Roster:");
    for p in peers {
        let rtt = p.round_trip_ms.map(|ms| format!("{ms:.1}ms")).unwrap_or_else(|| "-".into());
        let status = if p.online { "online" } else { "offline" };
        eprintln!("  {}  {:<16} {status:<8} rtt={rtt}", p.identity.fmt_short(), p.display_name);
    }
}

/// Two sessions on one simulated network: alice hands out a ticket, bob joins.
async fn run_simulation(config: SessionConfig) -> Result<()> {
    let network = MemoryNetwork::new();
    let alice = PeerSession::new(network.transport(), config.clone());
    let bob = PeerSession::new(network.transport(), config);

    alice.user_logged_in("alice").await?;
    bob.user_logged_in("bob").await?;
    if alice.local_identity().is_none() {
        alice.start_endpoint().await?;
    }
    if bob.local_identity().is_none() {
        bob.start_endpoint().await?;
    }

    let ticket = alice.generate_ticket().await?;
    eprintln!("alice's ticket: {ticket}");

    let mut alice_changes = alice.subscribe_roster();
    let peer = bob.connect(&ticket.to_string(), "bob").await?;
    eprintln!("bob connected to {}", peer.identity.fmt_short());

    tokio::time::timeout(Duration::from_secs(2), alice_changes.changed())
        .await
        .context("alice never saw bob")??;
    eprint!("alice's ");
    print_roster(&alice.get_roster().await);

    let bob_id = bob.local_identity().context("bob has no endpoint")?;
    alice.disconnect(&bob_id).await?;
    eprint!("after disconnect, alice's ");
    print_roster(&alice.get_roster().await);

    alice.shutdown().await;
    bob.shutdown().await;
    eprintln!("{} endpoint(s) still bound", network.bound_count());
    Ok(())
}
