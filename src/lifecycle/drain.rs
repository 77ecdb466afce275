//! Graceful drain of a worker's connections.
//!
//! # Responsibilities
//! - Close idle connections at once
//! - Let busy connections finish their pipeline without reading more
//! - Force-cancel whatever is still busy when the escalation window ends
//!
//! # Design Decisions
//! - Re-partitions once per second; busy connections become idle as they finish
//! - Bounded: returns within the escalation window plus one tick
//! - Never fails; the outcome is a [`DrainReport`]
//! - A connection holding a half-received request counts as idle

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::DrainConfig;
use crate::net::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::observability::metrics;

const REPARTITION_PERIOD: Duration = Duration::from_secs(1);

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections closed while idle.
    pub idle_closed: usize,
    /// Busy connections that finished inside the window.
    pub finished: usize,
    /// Busy connections cancelled when the window ran out.
    pub forced: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.idle_closed + self.finished + self.forced
    }
}

/// Drain controller for one worker.
#[derive(Debug, Clone)]
pub struct Drain {
    registry: ConnectionRegistry,
    escalation_window: Duration,
}

impl Drain {
    pub fn new(registry: ConnectionRegistry, config: &DrainConfig) -> Self {
        Self {
            registry,
            escalation_window: config.escalation_window(),
        }
    }

    pub async fn run(&self) -> DrainReport {
        let deadline = Instant::now() + self.escalation_window;
        let mut busy_seen: HashSet<ConnectionId> = HashSet::new();
        let mut report = DrainReport::default();
        let mut first_pass = true;

        loop {
            let (idle, busy): (Vec<Arc<ConnectionHandle>>, Vec<Arc<ConnectionHandle>>) = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|conn| !conn.is_closed())
                .partition(|conn| conn.pipeline_empty());

            let mut closed_now = 0;
            for conn in &idle {
                if !busy_seen.contains(&conn.id()) && conn.close() {
                    closed_now += 1;
                }
            }
            report.idle_closed += closed_now;
            if first_pass {
                tracing::info!(closed = closed_now, "Idle connections closed immediately");
                first_pass = false;
            }

            for conn in &busy {
                conn.close();
                busy_seen.insert(conn.id());
            }

            if busy.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(count = busy.len(), "Forcefully killing connections");
                for conn in &busy {
                    if conn.pipeline_cancel() {
                        report.forced += 1;
                    }
                }
                break;
            }

            let remaining = deadline - now;
            tracing::info!(
                remaining_secs = remaining.as_secs_f32().ceil() as u64,
                busy = busy.len(),
                "Connections still busy"
            );
            sleep(remaining.min(REPARTITION_PERIOD)).await;
        }

        report.finished = busy_seen.len().saturating_sub(report.forced);
        metrics::record_drain(&report);
        tracing::info!(
            idle_closed = report.idle_closed,
            finished = report.finished,
            forced = report.forced,
            "Drain complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ConnCommand, ConnectionGuard};

    fn config() -> DrainConfig {
        DrainConfig {
            escalation_window_secs: 5,
            ..DrainConfig::default()
        }
    }

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn connections(registry: &ConnectionRegistry, idle: usize, busy: usize) -> (Vec<ConnectionGuard>, Vec<ConnectionGuard>) {
        let idle = (0..idle).map(|_| registry.track(peer())).collect();
        let busy: Vec<ConnectionGuard> = (0..busy).map(|_| registry.track(peer())).collect();
        for conn in &busy {
            conn.begin_request();
        }
        (idle, busy)
    }

    #[tokio::test(start_paused = true)]
    async fn busy_connections_that_finish_are_not_forced() {
        let registry = ConnectionRegistry::new();
        let (idle, busy) = connections(&registry, 3, 2);
        let busy_handles: Vec<_> = busy.iter().map(|c| Arc::clone(c.handle())).collect();

        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            for conn in busy_handles {
                conn.finish_request();
            }
        });

        let started = Instant::now();
        let report = Drain::new(registry.clone(), &config()).run().await;

        assert_eq!(report, DrainReport { idle_closed: 3, finished: 2, forced: 0 });
        assert!(started.elapsed() <= Duration::from_secs(3));
        for conn in idle.iter().chain(&busy) {
            assert_eq!(conn.command(), ConnCommand::Close);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connections_are_cancelled_after_window() {
        let registry = ConnectionRegistry::new();
        let (idle, busy) = connections(&registry, 3, 2);

        let started = Instant::now();
        let report = Drain::new(registry.clone(), &config()).run().await;
        let elapsed = started.elapsed();

        assert_eq!(report, DrainReport { idle_closed: 3, finished: 0, forced: 2 });
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed <= Duration::from_secs(6));
        for conn in &idle {
            assert_eq!(conn.command(), ConnCommand::Close);
        }
        for conn in &busy {
            assert_eq!(conn.command(), ConnCommand::Cancel);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_registry_returns_at_once() {
        let started = Instant::now();
        let report = Drain::new(ConnectionRegistry::new(), &config()).run().await;
        assert_eq!(report.total(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn half_received_request_counts_as_idle() {
        let registry = ConnectionRegistry::new();
        let conn = registry.track(peer());
        // Head parsed, body still arriving: nothing is in the pipeline yet.
        conn.set_phase(crate::http::codec::DecodePhase::ParsingBody);
        conn.touch();

        let report = Drain::new(registry.clone(), &config()).run().await;
        assert_eq!(report.idle_closed, 1);
        assert_eq!(conn.command(), ConnCommand::Close);
    }
}
