//! Idle connection reaper.
//!
//! # Responsibilities
//! - Periodically scan the worker's live connections
//! - Close connections idle past the timeout whose pipeline is empty
//!
//! # Design Decisions
//! - Busy connections are never reaped; only drain escalation ends them
//! - Stateless across ticks; closing twice is a no-op
//! - Missed ticks are delayed, not bursted

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::ReaperConfig;
use crate::net::ConnectionRegistry;
use crate::observability::metrics;

/// Background sweep over one worker's connections.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: ConnectionRegistry,
    check_interval: Duration,
    idle_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: ConnectionRegistry, config: &ReaperConfig) -> Self {
        Self {
            registry,
            check_interval: config.check_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Close every idle connection whose last activity is older than the
    /// timeout. Returns how many were closed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for conn in self.registry.snapshot() {
            if conn.pipeline_empty() && conn.idle_for(now) > self.idle_timeout && conn.close() {
                tracing::debug!(
                    connection_id = %conn.id(),
                    peer_addr = %conn.peer_addr(),
                    idle_secs = conn.idle_for(now).as_secs(),
                    "Reaping idle connection"
                );
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "Closed idle connections");
            metrics::record_reaped(reaped);
        }
        reaped
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        tracing::debug!(
            check_interval_secs = self.check_interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
                _ = shutdown.recv() => break,
            }
        }

        tracing::debug!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::net::ConnCommand;

    fn config() -> ReaperConfig {
        ReaperConfig {
            enabled: true,
            check_interval_secs: 5,
            idle_timeout_secs: 60,
        }
    }

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reaps_only_idle_and_empty_connections() {
        let registry = ConnectionRegistry::new();
        let reaper = Reaper::new(registry.clone(), &config());

        let idle = registry.track(peer());
        let busy = registry.track(peer());
        busy.begin_request();

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = registry.track(peer());

        assert_eq!(reaper.sweep(Instant::now()), 1);
        assert_eq!(idle.command(), ConnCommand::Close);
        assert_eq!(busy.command(), ConnCommand::Open);
        assert_eq!(fresh.command(), ConnCommand::Open);

        // Idempotent.
        assert_eq!(reaper.sweep(Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_clock() {
        let registry = ConnectionRegistry::new();
        let reaper = Reaper::new(registry.clone(), &config());
        let conn = registry.track(peer());

        tokio::time::advance(Duration::from_secs(59)).await;
        conn.touch();
        tokio::time::advance(Duration::from_secs(59)).await;

        assert_eq!(reaper.sweep(Instant::now()), 0);
        assert_eq!(conn.command(), ConnCommand::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn next_tick_closes_timed_out_connection() {
        let registry = ConnectionRegistry::new();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(Reaper::new(registry.clone(), &config()).run(shutdown.subscribe()));

        let conn = registry.track(peer());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(conn.command(), ConnCommand::Open);

        // idle_timeout + ε, then at most one check interval.
        tokio::time::sleep(Duration::from_secs(1 + 5)).await;
        assert_eq!(conn.command(), ConnCommand::Close);

        shutdown.trigger();
        task.await.unwrap();
    }
}
