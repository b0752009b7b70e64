//! ICMP liveness probing.
//!
//! Each ICMP-enabled target runs its own probe loop: one echo request per
//! period, answered or not, pushed straight to the metrics channel. ICMP
//! sockets need elevated capability; when the clients cannot be created the
//! exporter logs a warning once and keeps running with TCP scans only.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use rand::Rng;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError, ICMP};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::target::Target;

const ECHO_PAYLOAD: [u8; 56] = [0; 56];

/// Liveness report for one target, one per probe period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub target_id: usize,
    pub responding: bool,
    pub rtt: Duration,
}

/// Shared ICMP sockets, one per address family actually in use.
pub struct PingClients {
    v4: Option<Client>,
    v6: Option<Client>,
}

impl PingClients {
    /// Creates the clients needed by `targets`. Creation failures degrade
    /// ICMP for the family instead of stopping the process.
    pub fn new(targets: &[Arc<Target>]) -> Self {
        let wants_v4 = targets
            .iter()
            .any(|t| t.icmp_enabled() && t.ip.is_ipv4());
        let wants_v6 = targets
            .iter()
            .any(|t| t.icmp_enabled() && t.ip.is_ipv6());

        let v4 = wants_v4.then(|| Client::new(&Config::default())).and_then(|created| match created {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("cannot create ICMPv4 socket ({e}), pings disabled; run with CAP_NET_RAW or net.ipv4.ping_group_range");
                None
            }
        });

        let v6 = wants_v6
            .then(|| Client::new(&Config::builder().kind(ICMP::V6).build()))
            .and_then(|created| match created {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("cannot create ICMPv6 socket ({e}), pings disabled for IPv6 targets");
                    None
                }
            });

        Self { v4, v6 }
    }

    fn client_for(&self, ip: IpAddr) -> Option<Client> {
        match ip {
            IpAddr::V4(_) => self.v4.clone(),
            IpAddr::V6(_) => self.v6.clone(),
        }
    }
}

/// Spawns one probe loop per ICMP-enabled target. Targets whose address
/// family has no usable socket are skipped with an error log.
pub fn spawn_probers(
    targets: &[Arc<Target>],
    clients: &PingClients,
    timeout: Duration,
    results: mpsc::Sender<PingResult>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for (target_id, target) in targets.iter().enumerate() {
        if !target.icmp_enabled() {
            continue;
        }

        let Some(client) = clients.client_for(target.ip) else {
            error!(
                "no ICMP socket for {} ({}), liveness probing disabled for this target",
                target.name, target.ip
            );
            continue;
        };

        let target = Arc::clone(target);
        let results = results.clone();
        handles.push(tokio::spawn(probe_loop(
            target, target_id, client, timeout, results,
        )));
    }

    handles
}

async fn probe_loop(
    target: Arc<Target>,
    target_id: usize,
    client: Client,
    timeout: Duration,
    results: mpsc::Sender<PingResult>,
) {
    // First echo after one full period, staggered so targets sharing the
    // socket don't all fire at the same instant.
    let jitter = first_fire_jitter();
    let mut ticker = interval_at(
        Instant::now() + target.icmp_period + jitter,
        target.icmp_period,
    );

    let ident = PingIdentifier(rand::rng().random());
    let mut pinger = client.pinger(target.ip, ident).await;
    pinger.timeout(timeout);

    let mut seq: u16 = 0;

    loop {
        ticker.tick().await;

        debug!("pinging {} ({})", target.name, target.ip);
        let rtt = match pinger.ping(PingSequence(seq), &ECHO_PAYLOAD).await {
            Ok((_, rtt)) => Some(rtt),
            Err(SurgeError::Timeout { .. }) => None,
            Err(e) => {
                // Transient send failure; wait out one timeout and retry
                // this period once.
                warn!("ping of {} ({}) failed: {e}", target.name, target.ip);
                sleep(timeout).await;
                seq = seq.wrapping_add(1);
                match pinger.ping(PingSequence(seq), &ECHO_PAYLOAD).await {
                    Ok((_, rtt)) => Some(rtt),
                    Err(_) => None,
                }
            }
        };
        seq = seq.wrapping_add(1);

        let result = PingResult {
            target_id,
            responding: rtt.is_some(),
            rtt: rtt.unwrap_or(Duration::ZERO),
        };
        if results.send(result).await.is_err() {
            break;
        }
    }
}

fn first_fire_jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(1000..=1500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_one_and_one_half_seconds() {
        for _ in 0..100 {
            let jitter = first_fire_jitter();
            assert!(jitter >= Duration::from_secs(1));
            assert!(jitter <= Duration::from_millis(1500));
        }
    }
}
