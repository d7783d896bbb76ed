use crate::state::{interface_name, TrafficCounters, TrafficState};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use ringtap::{SocketStats, Stats, TPacket};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub traffic: Arc<TrafficState>,
    pub tpacket: Arc<TPacket>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_total: Counter,
    bytes_total: Counter,
    kernel_drops_total: Counter,
    polls_total: Counter,
    interfaces_seen: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let bytes_total = Counter::default();
        let kernel_drops_total = Counter::default();
        let polls_total = Counter::default();
        let interfaces_seen = Gauge::default();

        registry.register(
            "ringtap_packets_total",
            "Total number of captured packets",
            packets_total.clone(),
        );
        registry.register(
            "ringtap_bytes_total",
            "Total wire bytes of captured packets",
            bytes_total.clone(),
        );
        registry.register(
            "ringtap_kernel_drops_total",
            "Packets the kernel dropped because the ring was full",
            kernel_drops_total.clone(),
        );
        registry.register(
            "ringtap_polls_total",
            "Blocking polls made while waiting for packets",
            polls_total.clone(),
        );
        registry.register(
            "ringtap_interfaces_seen",
            "Interfaces that delivered at least one packet",
            interfaces_seen.clone(),
        );

        Self {
            registry,
            packets_total,
            bytes_total,
            kernel_drops_total,
            polls_total,
            interfaces_seen,
        }
    }
}

/// Counters only go up, so move each one forward to the absolute value.
fn advance_to(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    capturing: bool,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    tpacket_version: String,
    total_packets: u64,
    total_bytes: u64,
    captured_bytes: u64,
    packets_per_second: f64,
    bytes_per_second: f64,
    read_errors: u64,
    local: Stats,
    /// None when the socket is closed or the query failed.
    kernel: Option<SocketStats>,
}

#[derive(Serialize)]
pub struct InterfaceEntry {
    ifindex: i32,
    name: Option<String>,
    #[serde(flatten)]
    counters: TrafficCounters,
}

#[derive(Serialize)]
pub struct VlanEntry {
    vlan_id: u16,
    #[serde(flatten)]
    counters: TrafficCounters,
}

#[derive(Serialize)]
pub struct InterfacesResponse {
    interfaces: Vec<InterfaceEntry>,
    vlans: Vec<VlanEntry>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/interfaces", get(get_interfaces))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(parse_allowlist(allowed_ips));
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn parse_allowlist(allowed_ips: &[String]) -> Vec<IpNet> {
    allowed_ips
        .iter()
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("ignoring allowlist entry {:?}: {}", s, e);
                None
            }
        })
        .collect()
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // If there is no ConnectInfo, allow (should not happen with into_make_service_with_connect_info).
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let capturing = !state.tpacket.is_closed();
    Json(HealthResponse {
        status: if capturing { "ok" } else { "stopped" }.to_string(),
        capturing,
        total_packets: state.traffic.total_packets.load(Ordering::Relaxed),
    })
}

fn stats_snapshot(state: &AppState) -> StatsResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = state.traffic.total_packets.load(Ordering::Relaxed);
    let total_bytes = state.traffic.total_bytes.load(Ordering::Relaxed);

    let packets_per_second = if uptime > 0 {
        total_packets as f64 / uptime as f64
    } else {
        0.0
    };
    let bytes_per_second = if uptime > 0 {
        total_bytes as f64 / uptime as f64
    } else {
        0.0
    };

    let kernel = match state.tpacket.socket_stats() {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::debug!("kernel stats unavailable: {}", e);
            None
        }
    };

    StatsResponse {
        uptime_seconds: uptime,
        tpacket_version: state.tpacket.version().to_string(),
        total_packets,
        total_bytes,
        captured_bytes: state.traffic.captured_bytes.load(Ordering::Relaxed),
        packets_per_second,
        bytes_per_second,
        read_errors: state.traffic.read_errors.load(Ordering::Relaxed),
        local: state.tpacket.stats(),
        kernel,
    }
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(stats_snapshot(&state))
}

async fn get_interfaces(State(state): State<Arc<AppState>>) -> Json<InterfacesResponse> {
    let interfaces = state
        .traffic
        .interfaces_by_packets()
        .into_iter()
        .map(|(ifindex, counters)| InterfaceEntry {
            ifindex,
            name: interface_name(ifindex),
            counters,
        })
        .collect();

    let mut vlans: Vec<_> = state
        .traffic
        .vlans
        .iter()
        .map(|entry| VlanEntry {
            vlan_id: *entry.key(),
            counters: entry.value().clone(),
        })
        .collect();
    vlans.sort_by_key(|v| v.vlan_id);

    Json(InterfacesResponse { interfaces, vlans })
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    advance_to(
        &metrics.packets_total,
        state.traffic.total_packets.load(Ordering::Relaxed),
    );
    advance_to(
        &metrics.bytes_total,
        state.traffic.total_bytes.load(Ordering::Relaxed),
    );
    advance_to(&metrics.polls_total, state.tpacket.stats().polls);
    if let Ok(kernel) = state.tpacket.socket_stats() {
        advance_to(&metrics.kernel_drops_total, kernel.drops);
    }
    metrics
        .interfaces_seen
        .set(state.traffic.interfaces.len() as i64);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let stats = match serde_json::to_string(&stats_snapshot(&state)) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize stats: {}", e);
                break;
            }
        };

        if socket.send(Message::Text(stats)).await.is_err() {
            break;
        }
    }
}
