//! Core functionality for actual scanning behaviour.
use log::{debug, info};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};

use crate::target::Target;

/// Outcome of a single port probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Open,
    Closed,
}

/// One probed port of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub target_id: usize,
    pub scan_id: u64,
    pub port: u16,
    pub status: PortStatus,
}

/// End-of-scan marker, emitted exactly once per scan after every
/// [`PortResult`] of that scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanComplete {
    pub target_id: usize,
    pub scan_id: u64,
    pub open_ports: Vec<u16>,
}

/// Events flowing from scan runners to the result receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Port(PortResult),
    Complete(ScanComplete),
}

/// Connect-scan runner shared by all targets.
///
/// Each probe acquires a permit from the process-wide semaphore before
/// dialing, so the number of in-flight connects never exceeds the
/// configured limit regardless of how many scans run concurrently. The
/// per-target launch rate is enforced separately by sleeping between probe
/// spawns.
#[derive(Debug, Clone)]
pub struct TcpScanner {
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl TcpScanner {
    pub fn new(timeout: Duration, permits: Arc<Semaphore>) -> Self {
        Self { timeout, permits }
    }

    /// Probes every declared port of `target` once and reports the results
    /// on `events`: one [`ScanEvent::Port`] per port, then exactly one
    /// [`ScanEvent::Complete`] carrying the open set.
    ///
    /// A probe that fails for any reason counts as closed; the scan itself
    /// never aborts.
    pub async fn scan_target(
        &self,
        target: &Target,
        target_id: usize,
        scan_id: u64,
        events: &mpsc::Sender<ScanEvent>,
    ) {
        let started = Instant::now();
        let pace = launch_interval(target.qps);

        debug!(
            "starting scan of {} ({}): {} ports, qps {}",
            target.name,
            target.ip,
            target.tcp_ports.len(),
            target.qps
        );

        let mut probes = Vec::with_capacity(target.tcp_ports.len());
        for (idx, &port) in target.tcp_ports.iter().enumerate() {
            // The rate cap paces launches, so the sleep goes between
            // probes, not before the first one.
            if let Some(delay) = pace.filter(|_| idx > 0) {
                sleep(delay).await;
            }
            let addr = SocketAddr::new(target.ip, port);
            let permits = self.permits.clone();
            let dial_timeout = self.timeout;
            probes.push((
                port,
                tokio::spawn(probe_port(addr, dial_timeout, permits)),
            ));
        }

        let mut open_ports = Vec::new();
        for (port, probe) in probes {
            let status = probe.await.unwrap_or(PortStatus::Closed);
            if status == PortStatus::Open {
                open_ports.push(port);
            }
            let result = PortResult {
                target_id,
                scan_id,
                port,
                status,
            };
            if events.send(ScanEvent::Port(result)).await.is_err() {
                debug!("result channel closed, abandoning scan of {}", target.name);
                return;
            }
        }

        info!(
            "scan of {} ({}) finished: {}/{} ports open in {:?}",
            target.name,
            target.ip,
            open_ports.len(),
            target.tcp_ports.len(),
            started.elapsed()
        );

        let complete = ScanComplete {
            target_id,
            scan_id,
            open_ports,
        };
        if events.send(ScanEvent::Complete(complete)).await.is_err() {
            debug!("result channel closed, dropping scan summary of {}", target.name);
        }
    }
}

/// Delay between successive probe launches for a target rate cap.
/// Unbounded rates and sub-millisecond delays skip sleeping entirely.
fn launch_interval(qps: u32) -> Option<Duration> {
    if qps == 0 {
        return None;
    }
    let delay = Duration::from_secs(1) / qps;
    (delay >= Duration::from_millis(1)).then_some(delay)
}

async fn probe_port(addr: SocketAddr, dial_timeout: Duration, permits: Arc<Semaphore>) -> PortStatus {
    let Ok(_permit) = permits.acquire_owned().await else {
        // Semaphore closed, the engine is shutting down.
        return PortStatus::Closed;
    };

    match connect(addr, dial_timeout).await {
        Ok(()) => PortStatus::Open,
        Err(e) if e.to_string().to_lowercase().contains("too many open files") => {
            // Out of file descriptors; give the kernel a breather and retry
            // this port once.
            debug!("file descriptors exhausted probing {addr}, retrying once");
            sleep(dial_timeout).await;
            match connect(addr, dial_timeout).await {
                Ok(()) => PortStatus::Open,
                Err(_) => PortStatus::Closed,
            }
        }
        Err(e) => {
            debug!("probe of {addr} failed: {e}");
            PortStatus::Closed
        }
    }
}

async fn connect(addr: SocketAddr, dial_timeout: Duration) -> io::Result<()> {
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!("connection to {addr} succeeded, closing stream");
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    fn local_target(ports: Vec<u16>, qps: u32) -> Target {
        Target {
            name: "localhost".to_owned(),
            ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            tcp_period: Duration::from_secs(60),
            icmp_period: Duration::ZERO,
            tcp_ports: ports,
            expected_ports: vec![],
            qps,
        }
    }

    async fn collect_events(
        scanner: &TcpScanner,
        target: &Target,
        scan_id: u64,
    ) -> (Vec<PortResult>, Vec<ScanComplete>) {
        let (tx, mut rx) = mpsc::channel(target.tcp_ports.len() + 1);
        scanner.scan_target(target, 0, scan_id, &tx).await;
        drop(tx);

        let mut ports = Vec::new();
        let mut completes = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Port(r) => ports.push(r),
                ScanEvent::Complete(c) => completes.push(c),
            }
        }
        (ports, completes)
    }

    #[tokio::test]
    async fn detects_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        // Bind and immediately drop a second listener to find a port that
        // is certainly closed.
        let closed_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };

        let mut ports = vec![open_port, closed_port];
        ports.sort_unstable();
        let target = local_target(ports.clone(), 0);
        let scanner = TcpScanner::new(Duration::from_millis(500), Arc::new(Semaphore::new(10)));

        let (results, completes) = collect_events(&scanner, &target, 1).await;

        let mut seen: Vec<u16> = results.iter().map(|r| r.port).collect();
        seen.sort_unstable();
        assert_eq!(seen, ports);

        for result in &results {
            let expected = if result.port == open_port {
                PortStatus::Open
            } else {
                PortStatus::Closed
            };
            assert_eq!(result.status, expected, "port {}", result.port);
        }

        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].scan_id, 1);
        assert_eq!(completes[0].open_ports, vec![open_port]);
    }

    #[tokio::test]
    async fn bounded_scan_covers_every_port() {
        // Many more probes than permits: the scan must still resolve every
        // port exactly once and finish with a single summary event.
        let ports: Vec<u16> = (1..=1000).collect();
        let target = local_target(ports, 0);
        let permits = Arc::new(Semaphore::new(100));
        let scanner = TcpScanner::new(Duration::from_millis(250), permits.clone());

        let (results, completes) = collect_events(&scanner, &target, 7).await;

        assert_eq!(results.len(), 1000);
        assert_eq!(completes.len(), 1);
        // Every permit is back once the scan is over.
        assert_eq!(permits.available_permits(), 100);

        let opens = results
            .iter()
            .filter(|r| r.status == PortStatus::Open)
            .count();
        assert_eq!(opens, completes[0].open_ports.len());
    }

    #[tokio::test]
    async fn rate_capped_scan_still_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let target = local_target(vec![open_port], 5);
        let scanner = TcpScanner::new(Duration::from_millis(500), Arc::new(Semaphore::new(10)));

        let (results, completes) = collect_events(&scanner, &target, 2).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, PortStatus::Open);
        assert_eq!(completes.len(), 1);
    }

    #[test]
    fn launch_interval_disabled_for_zero_and_huge_rates() {
        assert_eq!(launch_interval(0), None);
        assert_eq!(launch_interval(10_000), None);
        assert_eq!(launch_interval(5), Some(Duration::from_millis(200)));
    }
}
