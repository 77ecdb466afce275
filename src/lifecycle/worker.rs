//! Worker process entry.
//!
//! # Responsibilities
//! - Read the coordination variables set by the supervisor
//! - Adopt the inherited listening socket
//! - Run one single-threaded event loop serving the app until a signal
//!
//! # Design Decisions
//! - `current_thread` runtime: one unit of work at a time per worker
//! - On Linux the worker asks for SIGTERM if the supervisor dies
//! - Signal handlers are installed before the first accept

use std::ffi::OsStr;
use std::os::fd::RawFd;

use tracing::Instrument;

use crate::app::App;
use crate::config::ServerConfig;
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::signals::WorkerSignals;
use crate::lifecycle::Shutdown;
use crate::net::listener::{adopt, Listener, ListenerError};
use crate::observability::logging::worker_span;

/// Marks a process as a worker (`FORKSERVE_ROLE=worker`).
pub const ROLE_ENV: &str = "FORKSERVE_ROLE";
pub const WORKER_ROLE: &str = "worker";
/// Inherited listening descriptor number.
pub const LISTEN_FD_ENV: &str = "FORKSERVE_LISTEN_FD";
pub const WORKER_INDEX_ENV: &str = "FORKSERVE_WORKER_INDEX";
pub const GENERATION_ENV: &str = "FORKSERVE_GENERATION";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("environment variable {name} is missing or invalid")]
    Environment { name: &'static str },
    #[error("failed to build the worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Coordination variables a worker is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    pub listen_fd: RawFd,
    pub index: usize,
    pub generation: u64,
}

impl WorkerEnv {
    /// `Ok(None)` when this process is not a worker.
    pub fn from_env() -> Result<Option<Self>, WorkerError> {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    pub(crate) fn from_lookup<F, S>(lookup: F) -> Result<Option<Self>, WorkerError>
    where
        F: Fn(&'static str) -> Option<S>,
        S: AsRef<OsStr>,
    {
        let is_worker = lookup(ROLE_ENV).is_some_and(|role| role.as_ref() == WORKER_ROLE);
        if !is_worker {
            return Ok(None);
        }

        fn parsed<T: std::str::FromStr, S: AsRef<OsStr>>(
            name: &'static str,
            value: Option<S>,
        ) -> Result<T, WorkerError> {
            value
                .as_ref()
                .and_then(|v| v.as_ref().to_str())
                .and_then(|v| v.parse().ok())
                .ok_or(WorkerError::Environment { name })
        }

        Ok(Some(Self {
            listen_fd: parsed(LISTEN_FD_ENV, lookup(LISTEN_FD_ENV))?,
            index: parsed(WORKER_INDEX_ENV, lookup(WORKER_INDEX_ENV))?,
            generation: parsed(GENERATION_ENV, lookup(GENERATION_ENV))?,
        }))
    }
}

/// Serve `app` on the inherited socket until SIGTERM/SIGINT/SIGHUP.
pub fn run(app: App, config: ServerConfig, env: WorkerEnv) -> Result<(), WorkerError> {
    request_parent_death_signal();

    let std_listener = adopt(env.listen_fd)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)?;

    let span = worker_span(env.index, env.generation);
    runtime.block_on(
        async move {
            let mut signals = WorkerSignals::install().map_err(WorkerError::Signals)?;
            let listener = Listener::from_std(std_listener, config.listener.max_connections)?;
            tracing::info!("Worker started");

            let shutdown = Shutdown::new();
            let server = HttpServer::new(app, config);
            let serving = server.run(listener, shutdown.subscribe());
            tokio::pin!(serving);

            let report = tokio::select! {
                result = &mut serving => result?,
                _ = signals.recv() => {
                    shutdown.trigger();
                    serving.await?
                }
            };

            tracing::info!(
                idle_closed = report.idle_closed,
                finished = report.finished,
                forced = report.forced,
                "Worker exiting"
            );
            Ok::<(), WorkerError>(())
        }
        .instrument(span),
    )
}

#[cfg(target_os = "linux")]
fn request_parent_death_signal() {
    // SAFETY: prctl with PR_SET_PDEATHSIG only changes this process's own
    // death-signal setting.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) };
    if rc != 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "Failed to set parent death signal");
    }
}

#[cfg(not(target_os = "linux"))]
fn request_parent_death_signal() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&'static str) -> Option<&'static str> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        move |name| vars.get(name).copied()
    }

    #[test]
    fn non_workers_have_no_env() {
        assert_eq!(WorkerEnv::from_lookup(lookup(&[])).unwrap(), None);
        assert_eq!(
            WorkerEnv::from_lookup(lookup(&[(ROLE_ENV, "supervisor"), (LISTEN_FD_ENV, "3")])).unwrap(),
            None
        );
    }

    #[test]
    fn workers_read_all_variables() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (ROLE_ENV, WORKER_ROLE),
            (LISTEN_FD_ENV, "7"),
            (WORKER_INDEX_ENV, "2"),
            (GENERATION_ENV, "3"),
        ]))
        .unwrap();
        assert_eq!(
            env,
            Some(WorkerEnv {
                listen_fd: 7,
                index: 2,
                generation: 3
            })
        );
    }

    #[test]
    fn missing_descriptor_is_an_error() {
        let result = WorkerEnv::from_lookup(lookup(&[(ROLE_ENV, WORKER_ROLE), (WORKER_INDEX_ENV, "0")]));
        assert!(matches!(result, Err(WorkerError::Environment { name: LISTEN_FD_ENV })));
    }
}
