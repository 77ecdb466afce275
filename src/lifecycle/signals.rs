//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events for workers and the supervisor
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Handlers are owned values scoped to their process role, never globals
//! - SIGHUP reloads only when reload is enabled; otherwise it terminates

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// Stop every worker and exit; carries the signal name.
    Terminate(&'static str),
    /// Start a new worker generation and retire the current one.
    Reload,
}

/// Signal streams installed by the supervisor.
pub struct SupervisorSignals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
    reload_enabled: bool,
}

impl SupervisorSignals {
    pub fn install(reload_enabled: bool) -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            reload_enabled,
        })
    }

    pub async fn recv(&mut self) -> SupervisorSignal {
        tokio::select! {
            _ = self.terminate.recv() => SupervisorSignal::Terminate("SIGTERM"),
            _ = self.interrupt.recv() => SupervisorSignal::Terminate("SIGINT"),
            _ = self.hangup.recv() => {
                if self.reload_enabled {
                    SupervisorSignal::Reload
                } else {
                    SupervisorSignal::Terminate("SIGHUP")
                }
            }
        }
    }
}

/// Signal streams installed by a worker; any of them starts a drain.
pub struct WorkerSignals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl WorkerSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next shutdown signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.hangup.recv() => "SIGHUP",
        };
        tracing::info!(signal = name, "Shutdown signal received");
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hangup_maps_to_reload_only_when_enabled() {
        let mut reloading = SupervisorSignals::install(true).unwrap();
        let mut terminating = SupervisorSignals::install(false).unwrap();

        // SAFETY: signalling our own process; handlers are installed above.
        unsafe { libc::kill(libc::getpid(), libc::SIGHUP) };

        assert_eq!(reloading.recv().await, SupervisorSignal::Reload);
        assert_eq!(terminating.recv().await, SupervisorSignal::Terminate("SIGHUP"));
    }
}
