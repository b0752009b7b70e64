//! Gauge ownership and the Prometheus exposition endpoint.
//!
//! [`MetricsServer`] owns the registry, every gauge and the per-target
//! liveness state. Gauges are only ever touched from its single consumer
//! loop, so no locking is needed anywhere in the metrics path.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{BoxError, Router};
use log::{debug, error};
use prometheus::{GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;

use crate::ping::PingResult;
use crate::receiver::MetricsUpdate;
use crate::scheduler::Trigger;
use crate::target::Target;

/// Address of the exposition endpoint.
pub const LISTEN_ADDR: &str = "0.0.0.0:2112";

/// How long a scrape request may take before it is cut off.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the trigger-queue depth is sampled.
const PENDING_SAMPLE_PERIOD: Duration = Duration::from_secs(5);

const UPTIME_TICK: Duration = Duration::from_secs(5);

/// Owns every gauge and the `ip -> responding` state behind them.
pub struct MetricsServer {
    registry: Registry,
    labels: Vec<[String; 2]>,
    targets: Vec<Arc<Target>>,

    targets_total: IntGauge,
    uptime: IntGauge,
    not_responding_total: IntGauge,
    pending_scans: IntGauge,
    open_ports: IntGaugeVec,
    unexpected_open: IntGaugeVec,
    unexpected_closed: IntGaugeVec,
    diff_ports: IntGaugeVec,
    rtt: GaugeVec,

    not_responding: HashMap<IpAddr, bool>,
}

impl MetricsServer {
    pub fn new(targets: Vec<Arc<Target>>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let targets_total = IntGauge::new(
            "scanexporter_targets_number_total",
            "Number of targets detected in config file.",
        )?;
        let uptime = IntGauge::new(
            "scanexporter_uptime_sec",
            "Scan exporter uptime, in seconds.",
        )?;
        let not_responding_total = IntGauge::new(
            "scanexporter_icmp_not_responding_total",
            "Number of targets that doesn't respond to pings.",
        )?;
        let pending_scans = IntGauge::new(
            "scanexporter_pending_scans",
            "Number of triggered scans waiting to run.",
        )?;
        let open_ports = IntGaugeVec::new(
            Opts::new("scanexporter_open_ports_total", "Number of ports that are open."),
            &["name", "ip"],
        )?;
        let unexpected_open = IntGaugeVec::new(
            Opts::new(
                "scanexporter_unexpected_open_ports_total",
                "Number of ports that are open, and shouldn't be.",
            ),
            &["name", "ip"],
        )?;
        let unexpected_closed = IntGaugeVec::new(
            Opts::new(
                "scanexporter_unexpected_closed_ports_total",
                "Number of ports that are closed and shouldn't be.",
            ),
            &["name", "ip"],
        )?;
        let diff_ports = IntGaugeVec::new(
            Opts::new(
                "scanexporter_diff_ports_total",
                "Number of ports that are different from previous scan.",
            ),
            &["name", "ip"],
        )?;
        let rtt = GaugeVec::new(
            Opts::new(
                "scanexporter_rtt_total",
                "Response time of the last ICMP echo request, in seconds.",
            ),
            &["name", "ip"],
        )?;

        registry.register(Box::new(targets_total.clone()))?;
        registry.register(Box::new(uptime.clone()))?;
        registry.register(Box::new(not_responding_total.clone()))?;
        registry.register(Box::new(pending_scans.clone()))?;
        registry.register(Box::new(open_ports.clone()))?;
        registry.register(Box::new(unexpected_open.clone()))?;
        registry.register(Box::new(unexpected_closed.clone()))?;
        registry.register(Box::new(diff_ports.clone()))?;
        registry.register(Box::new(rtt.clone()))?;

        let labels = targets
            .iter()
            .map(|t| [t.name.clone(), t.ip.to_string()])
            .collect();

        Ok(Self {
            registry,
            labels,
            targets,
            targets_total,
            uptime,
            not_responding_total,
            pending_scans,
            open_ports,
            unexpected_open,
            unexpected_closed,
            diff_ports,
            rtt,
            not_responding: HashMap::new(),
        })
    }

    /// Handle to the registry for the exposition endpoint.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn set_targets_total(&self, count: usize) {
        self.targets_total.set(count as i64);
    }

    /// Spawns the uptime ticker: +5 seconds every 5 seconds.
    pub fn spawn_uptime(&self) -> JoinHandle<()> {
        let uptime = self.uptime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UPTIME_TICK);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                uptime.add(UPTIME_TICK.as_secs() as i64);
            }
        })
    }

    /// Single consumer loop for everything that mutates a gauge: scan
    /// updates, ping results and the periodic trigger-queue depth sample.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<MetricsUpdate>,
        mut pings: mpsc::Receiver<PingResult>,
        triggers: mpsc::Sender<Trigger>,
    ) {
        let mut pending_tick = tokio::time::interval(PENDING_SAMPLE_PERIOD);

        loop {
            tokio::select! {
                Some(update) = updates.recv() => self.handle_update(update),
                Some(ping) = pings.recv() => self.handle_ping(ping),
                _ = pending_tick.tick() => {
                    let depth = triggers.max_capacity() - triggers.capacity();
                    self.pending_scans.set(depth as i64);
                }
            }
        }
    }

    fn handle_update(&self, update: MetricsUpdate) {
        let labels = &self.labels[update.target_id];
        let labels = [labels[0].as_str(), labels[1].as_str()];

        self.open_ports
            .with_label_values(&labels)
            .set(update.open_ports.len() as i64);
        self.unexpected_open
            .with_label_values(&labels)
            .set(update.unexpected_open.len() as i64);
        self.unexpected_closed
            .with_label_values(&labels)
            .set(update.unexpected_closed.len() as i64);
        if let Some(delta) = update.delta {
            self.diff_ports.with_label_values(&labels).set(delta as i64);
        }
    }

    fn handle_ping(&mut self, ping: PingResult) {
        let target = &self.targets[ping.target_id];
        let labels = &self.labels[ping.target_id];
        let labels = [labels[0].as_str(), labels[1].as_str()];

        self.rtt
            .with_label_values(&labels)
            .set(ping.rtt.as_secs_f64());

        // Only state transitions move the global counter.
        let was_down = self.not_responding.entry(target.ip).or_insert(false);
        if ping.responding && *was_down {
            self.not_responding_total.dec();
            *was_down = false;
        } else if !ping.responding && !*was_down {
            debug!("{} ({}) stopped responding to pings", target.name, target.ip);
            self.not_responding_total.inc();
            *was_down = true;
        }
    }
}

/// Serves the text exposition format on `/metrics`; every other path is a
/// 404. Requests are cut off after [`REQUEST_TIMEOUT`].
pub async fn serve(listener: TcpListener, registry: Registry) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
        .with_state(registry)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(request_timed_out))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        );

    axum::serve(listener, app).await
}

async fn render_metrics(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("cannot encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 page not found")
}

async fn request_timed_out(_: BoxError) -> StatusCode {
    StatusCode::REQUEST_TIMEOUT
}
