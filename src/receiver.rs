//! Collects scan events and turns each finished scan into a metrics update.
//!
//! A single task receives the per-port results of every runner. When a
//! scan's summary arrives it classifies open ports against the target's
//! expected set, computes how many ports changed since the previous scan,
//! and hands one update to the metrics server. The receiver is the only
//! writer of the previous-scan store.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::scanner::{PortStatus, ScanComplete, ScanEvent};
use crate::store::ListStore;
use crate::target::Target;

/// Counts published for one finished scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsUpdate {
    pub target_id: usize,
    pub open_ports: Vec<u16>,
    pub unexpected_open: Vec<u16>,
    pub unexpected_closed: Vec<u16>,
    /// Ports that changed state since the previous scan. `None` when the
    /// previous set could not be read; the diff gauge then keeps its value.
    pub delta: Option<usize>,
}

#[derive(Debug, Default)]
struct ScanBuffer {
    open: Vec<u16>,
    closed: Vec<u16>,
}

/// Aggregates [`ScanEvent`]s into [`MetricsUpdate`]s.
pub struct Receiver {
    targets: Vec<Arc<Target>>,
    store: Box<dyn ListStore>,
    scans: HashMap<u64, ScanBuffer>,
}

impl Receiver {
    pub fn new(targets: Vec<Arc<Target>>, store: Box<dyn ListStore>) -> Self {
        Self {
            targets,
            store,
            scans: HashMap::new(),
        }
    }

    /// Consumes scan events until every runner is gone, forwarding one
    /// update per finished scan.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ScanEvent>,
        updates: mpsc::Sender<MetricsUpdate>,
    ) {
        while let Some(event) = events.recv().await {
            if let Some(update) = self.on_event(event) {
                if updates.send(update).await.is_err() {
                    break;
                }
            }
        }
    }

    fn on_event(&mut self, event: ScanEvent) -> Option<MetricsUpdate> {
        match event {
            ScanEvent::Port(result) => {
                let buffer = self.scans.entry(result.scan_id).or_default();
                match result.status {
                    PortStatus::Open => buffer.open.push(result.port),
                    PortStatus::Closed => buffer.closed.push(result.port),
                }
                None
            }
            ScanEvent::Complete(complete) => Some(self.finish_scan(complete)),
        }
    }

    fn finish_scan(&mut self, complete: ScanComplete) -> MetricsUpdate {
        let buffer = self.scans.remove(&complete.scan_id).unwrap_or_default();
        let target = &self.targets[complete.target_id];

        let mut open_ports = buffer.open;
        open_ports.sort_unstable();
        open_ports.dedup();

        let expected: HashSet<u16> = target.expected_ports.iter().copied().collect();
        let open_set: HashSet<u16> = open_ports.iter().copied().collect();

        let unexpected_open: Vec<u16> = open_ports
            .iter()
            .copied()
            .filter(|port| !expected.contains(port))
            .collect();
        let unexpected_closed: Vec<u16> = target
            .expected_ports
            .iter()
            .copied()
            .filter(|port| !open_set.contains(port))
            .collect();

        let key = target.store_key("tcp");
        let delta = match self.store.read_list(&key) {
            Ok(previous) => {
                let delta = changed_ports(&previous, &open_ports);
                if let Err(e) = self.store.replace_list(&key, &open_ports) {
                    error!("cannot persist open ports for {key}: {e}");
                }
                Some(delta)
            }
            Err(e) => {
                // Keep the stored set authoritative for the next scan.
                warn!("cannot read previous scan for {key}: {e}, skipping diff");
                None
            }
        };

        debug!(
            "scan {} of {} ({}): open [{}], closed {} ports, unexpected open [{}], unexpected closed [{}]",
            complete.scan_id,
            target.name,
            target.ip,
            open_ports.iter().join(","),
            buffer.closed.len(),
            unexpected_open.iter().join(","),
            unexpected_closed.iter().join(","),
        );

        MetricsUpdate {
            target_id: complete.target_id,
            open_ports,
            unexpected_open,
            unexpected_closed,
            delta,
        }
    }
}

/// Number of ports present in exactly one of the two sets, i.e. the size
/// of their symmetric difference. Zero means nothing changed.
fn changed_ports(previous: &[u16], current: &[u16]) -> usize {
    let previous: HashSet<u16> = previous.iter().copied().collect();
    let current: HashSet<u16> = current.iter().copied().collect();
    previous.symmetric_difference(&current).count()
}
