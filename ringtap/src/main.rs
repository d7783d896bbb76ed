use anyhow::Context as _;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringtap::TPacket;

mod api;
mod capture;
mod config;
mod ebpf;
mod state;

use config::{CliArgs, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Capture socket ────────────────────────────────────────────────
    let iface = config.interface.as_deref().unwrap_or("all interfaces");
    let tp = Arc::new(
        TPacket::open(config.capture_options())
            .with_context(|| format!("failed to open capture ring on {}", iface))?,
    );
    tracing::info!(
        "{} ring open on {} ({} bytes)",
        tp.version(),
        iface,
        tp.geometry().mapping_size()
    );

    // ── Filters ───────────────────────────────────────────────────────
    if let Some(ref path) = config.filter_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file {}", path))?;
        let program = ringtap::parse_ddd(&text)?;
        tp.attach_classic_filter(&program)?;
        tracing::info!("classic filter attached ({} instructions)", program.len());
    }

    // Held so the filter's map outlives startup.
    let _bpf = match config.ebpf_object {
        Some(ref object) => {
            if config.ether_types.is_empty() {
                tracing::warn!("eBPF filter has no ether types configured and will drop everything");
            }
            Some(ebpf::attach_socket_filter(
                &tp,
                Path::new(object),
                &config.ether_types,
            )?)
        }
        None => None,
    };

    // ── Fanout ────────────────────────────────────────────────────────
    if let Some(ref fanout) = config.fanout {
        tp.set_fanout(fanout.mode, fanout.group_id)?;
        tracing::info!("joined fanout group {} ({:?})", fanout.group_id, fanout.mode);
    }

    // ── State & Capture Thread ────────────────────────────────────────
    let traffic_state = Arc::new(state::TrafficState::new());
    let running = Arc::new(AtomicBool::new(true));
    let capture_thread = capture::spawn(
        tp.clone(),
        traffic_state.clone(),
        running.clone(),
        config.capture.add_vlan_header,
    )?;

    // ── Shutdown ──────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler({
        let tp = tp.clone();
        let running = running.clone();
        move || {
            tracing::info!("shutting down");
            running.store(false, Ordering::Relaxed);
            tp.close();
            let _ = shutdown_tx.send(true);
        }
    })?;

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        traffic: traffic_state.clone(),
        tpacket: tp.clone(),
        start_time: std::time::Instant::now(),
    });

    let allowed_ips = config.allowed_ips.clone();
    let app = api::router(app_state, &allowed_ips);

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    capture_thread
        .join()
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;
    tracing::info!(
        "captured {} packets",
        traffic_state.total_packets.load(Ordering::Relaxed)
    );

    Ok(())
}
