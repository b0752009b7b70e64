//! Binary entry point: wires configuration, channels and long-lived tasks.
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Semaphore};

use scan_exporter::input::{Config, Opts};
use scan_exporter::metrics::{self, MetricsServer};
use scan_exporter::ping::{self, PingClients};
use scan_exporter::receiver::Receiver;
use scan_exporter::scanner::TcpScanner;
use scan_exporter::scheduler::{self, ScanGate};
use scan_exporter::store::{self, ListStore, MemoryStore};
use scan_exporter::target::Target;

fn main() {
    let opts = Opts::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(procs) = opts.procs {
        builder.worker_threads(procs);
    }

    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(opts)) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let config = Config::from_file(&opts.config)
        .with_context(|| format!("cannot load {}", opts.config.display()))?;

    init_logging(opts.log_level.as_deref().or(config.log_level.as_deref()));

    let timeout = config.timeout()?;
    let limit = clamp_to_open_file_limit(config.limit()?);

    let targets = config
        .targets
        .iter()
        .map(|spec| Target::from_config(spec, &config).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    info!("{} targets found in {}", targets.len(), opts.config.display());
    if targets.is_empty() {
        warn!("no targets declared, nothing will be scanned");
    }

    let store: Box<dyn ListStore> = match &opts.db_url {
        Some(url) => Box::new(store::open_with_backoff(url).await?),
        None => Box::new(MemoryStore::new()),
    };

    let metrics_server = MetricsServer::new(targets.clone())?;
    metrics_server.set_targets_total(targets.len());
    let registry = metrics_server.registry();

    let listener = TcpListener::bind(metrics::LISTEN_ADDR)
        .await
        .with_context(|| format!("cannot bind metrics endpoint on {}", metrics::LISTEN_ADDR))?;
    info!("metrics endpoint listening on {}", metrics::LISTEN_ADDR);

    // Channels between the long-lived tasks. The trigger queue holds a few
    // fires per target, though a busy target never queues more than one.
    let (trigger_tx, trigger_rx) = mpsc::channel(targets.len().max(4) * 4);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (update_tx, update_rx) = mpsc::channel(64);
    let (ping_tx, ping_rx) = mpsc::channel(64);

    metrics_server.spawn_uptime();
    tokio::spawn(metrics_server.run(update_rx, ping_rx, trigger_tx.clone()));

    tokio::spawn(Receiver::new(targets.clone(), store).run(event_rx, update_tx));

    let gate = Arc::new(ScanGate::new(targets.len()));
    let scanner = TcpScanner::new(timeout, Arc::new(Semaphore::new(limit)));
    tokio::spawn(scheduler::dispatch(
        trigger_rx,
        scanner,
        targets.clone(),
        Arc::clone(&gate),
        event_tx,
    ));
    scheduler::spawn_tcp_schedules(&targets, gate, trigger_tx);

    let clients = PingClients::new(&targets);
    ping::spawn_probers(&targets, &clients, timeout, ping_tx);

    let mut serve_task = tokio::spawn(metrics::serve(listener, registry));
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("termination signal received, shutting down"),
        result = &mut serve_task => match result {
            Ok(Err(e)) => bail!("metrics server failed: {e}"),
            Ok(Ok(())) => bail!("metrics server stopped unexpectedly"),
            Err(e) => bail!("metrics server task failed: {e}"),
        },
    }

    Ok(())
}

fn init_logging(level: Option<&str>) {
    let requested = level.unwrap_or("info");
    let level = requested.parse().unwrap_or_else(|_| {
        eprintln!("cannot parse log level {requested:?}, using 'info'");
        LevelFilter::Info
    });

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Lowers the connect limit when it cannot be honored with the process'
/// open file limit, keeping some descriptors for the endpoint and store.
fn clamp_to_open_file_limit(limit: usize) -> usize {
    match rlimit::Resource::NOFILE.get() {
        Ok((soft, _)) => {
            let headroom = soft.saturating_sub(64).max(1);
            if limit as u64 > headroom {
                let clamped = usize::try_from(headroom).unwrap_or(limit);
                warn!("limit {limit} exceeds the open file limit {soft}, lowering to {clamped}");
                clamped
            } else {
                limit
            }
        }
        Err(e) => {
            warn!("cannot read the open file limit: {e}");
            limit
        }
    }
}
