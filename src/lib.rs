//! Internal functionality of the scan-exporter daemon.
//!
//! scan-exporter is a long-running Prometheus exporter that watches a set of
//! declared targets. For every target it periodically connect-scans a
//! configured range of TCP ports, optionally pings the host over ICMP, and
//! publishes the outcome as gauges on an HTTP endpoint:
//!
//! - how many ports are open,
//! - how many open ports were not declared as expected,
//! - how many expected ports are closed,
//! - how many ports changed state since the previous scan,
//! - whether the host answers ICMP echo requests, and how fast.
//!
//! ## Architecture Overview
//!
//! Every scan-related task communicates over bounded channels:
//!
//! 1. One scheduler task per target fires a trigger at each period. A
//!    trigger arriving while a scan for the same target is still running is
//!    dropped, never queued.
//! 2. [`scanner::TcpScanner`] turns a trigger into one probe per declared
//!    port, bounded by a process-wide connect semaphore and the per-target
//!    launch rate, and emits typed [`scanner::ScanEvent`]s.
//! 3. [`receiver::Receiver`] collects the per-port events, compares the
//!    open set against the previous scan kept in a [`store::ListStore`],
//!    and emits one metrics update per finished scan.
//! 4. [`metrics::MetricsServer`] owns every gauge and is their only writer;
//!    it consumes scan updates and ping results, and serves the text
//!    exposition format over HTTP.
//!
//! ICMP probes ([`ping`]) bypass aggregation and feed the metrics server
//! directly.

pub mod input;

pub mod target;

pub mod scanner;

pub mod scheduler;

pub mod ping;

pub mod receiver;

pub mod store;

pub mod metrics;
