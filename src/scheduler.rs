//! Periodic scan triggers, one schedule per target.
//!
//! Every TCP-enabled target gets its own timer task. Per-target state (the
//! in-flight claim) lives with that task instead of a central queue: a tick
//! that fires while the previous scan of the same target is still running
//! is dropped and counted, never queued behind it.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::scanner::{ScanEvent, TcpScanner};
use crate::target::Target;

/// Request to scan one target, emitted by its schedule task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub target_id: usize,
}

/// Tracks which targets currently have a scan in flight.
///
/// A schedule task claims its target before submitting a trigger and the
/// runner releases it once the scan summary is out, keeping scans of the
/// same target strictly serialized.
#[derive(Debug)]
pub struct ScanGate {
    in_flight: Vec<AtomicBool>,
    dropped: AtomicU64,
}

impl ScanGate {
    pub fn new(targets: usize) -> Self {
        Self {
            in_flight: (0..targets).map(|_| AtomicBool::new(false)).collect(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Claims the target for a new scan. Returns false and counts the fire
    /// as dropped when a scan is already running.
    pub fn begin(&self, target_id: usize) -> bool {
        if self.in_flight[target_id].swap(true, Ordering::AcqRel) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn finish(&self, target_id: usize) {
        self.in_flight[target_id].store(false, Ordering::Release);
    }

    /// Number of scheduler fires dropped because a scan was still running.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns one periodic schedule task per TCP-enabled target. The first
/// fire happens immediately, later ones at `tcp_period` intervals.
pub fn spawn_tcp_schedules(
    targets: &[Arc<Target>],
    gate: Arc<ScanGate>,
    triggers: mpsc::Sender<Trigger>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for (target_id, target) in targets.iter().enumerate() {
        if !target.tcp_enabled() {
            continue;
        }

        let target = Arc::clone(target);
        let gate = Arc::clone(&gate);
        let triggers = triggers.clone();

        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(target.tcp_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if !gate.begin(target_id) {
                    warn!(
                        "scan of {} ({}) still running, dropping this trigger",
                        target.name, target.ip
                    );
                    continue;
                }

                debug!("requesting scan of {} ({})", target.name, target.ip);
                if triggers.send(Trigger { target_id }).await.is_err() {
                    gate.finish(target_id);
                    break;
                }
            }
        }));
    }

    handles
}

/// Turns accepted triggers into scan runs. Each run gets a fresh scan id
/// and releases its target's claim once the runner is done.
pub async fn dispatch(
    mut triggers: mpsc::Receiver<Trigger>,
    scanner: TcpScanner,
    targets: Vec<Arc<Target>>,
    gate: Arc<ScanGate>,
    events: mpsc::Sender<ScanEvent>,
) {
    let mut next_scan_id: u64 = 0;

    while let Some(trigger) = triggers.recv().await {
        next_scan_id += 1;
        let scan_id = next_scan_id;

        let target = Arc::clone(&targets[trigger.target_id]);
        let scanner = scanner.clone();
        let gate = Arc::clone(&gate);
        let events = events.clone();

        tokio::spawn(async move {
            scanner
                .scan_target(&target, trigger.target_id, scan_id, &events)
                .await;
            gate.finish(trigger.target_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_serializes_scans_per_target() {
        let gate = ScanGate::new(2);

        assert!(gate.begin(0));
        // Second fire for the same target while the first scan runs.
        assert!(!gate.begin(0));
        assert_eq!(gate.dropped(), 1);

        // Other targets are unaffected.
        assert!(gate.begin(1));

        gate.finish(0);
        assert!(gate.begin(0));
        assert_eq!(gate.dropped(), 1);
    }

    #[test]
    fn gate_counts_every_dropped_fire() {
        let gate = ScanGate::new(1);

        assert!(gate.begin(0));
        for _ in 0..3 {
            assert!(!gate.begin(0));
        }
        assert_eq!(gate.dropped(), 3);
    }
}
