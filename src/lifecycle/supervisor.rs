//! Worker process supervisor.
//!
//! # Responsibilities
//! - Bind the listening socket once and make it inheritable
//! - Spawn N workers that all accept on that socket
//! - Report every worker exit (code or signal)
//! - SIGTERM/SIGINT: signal every worker, wait, SIGKILL stragglers
//! - Reload (SIGHUP or a watched file change): start a new generation on the
//!   same socket, then retire the old one
//!
//! # Design Decisions
//! - Workers are re-executions of the current binary with coordination
//!   variables; nothing is shared with them but the descriptor
//! - The supervisor accepts nothing; it keeps its copy of the socket only
//!   when reload is enabled
//! - Exits are delivered on a channel by one wait task per child, so the
//!   worker set is owned and mutated by a single loop

use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::net::TcpListener as StdTcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::watcher::{next_change, ReloadWatcher};
use crate::config::ServerConfig;
use crate::lifecycle::signals::{SupervisorSignal, SupervisorSignals};
use crate::lifecycle::worker::{GENERATION_ENV, LISTEN_FD_ENV, ROLE_ENV, WORKER_INDEX_ENV, WORKER_ROLE};
use crate::net::listener::{adopt, bind_shared, set_inheritable, ListenerError};
use crate::observability::metrics;

/// How long to wait for SIGKILLed workers to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to make the listening socket inheritable: {0}")]
    Inherit(#[source] std::io::Error),
    #[error("failed to locate the current executable: {0}")]
    Executable(#[source] std::io::Error),
    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error("failed to start the reload watcher: {0}")]
    Watcher(#[from] notify::Error),
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Code(i32),
    Signal(i32),
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitKind::Clean,
            (Some(code), _) => ExitKind::Code(code),
            (None, Some(signal)) => ExitKind::Signal(signal),
            (None, None) => ExitKind::Code(-1),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ExitKind::Clean => "clean",
            ExitKind::Code(_) => "code",
            ExitKind::Signal(_) => "signal",
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "Worker exited cleanly"),
            ExitKind::Code(code) => write!(f, "Worker exited with code {}", code),
            ExitKind::Signal(signal) => write!(f, "Worker crashed on signal {}", signal_name(*signal)),
        }
    }
}

/// Conventional name of a signal number.
pub fn signal_name(signal: i32) -> Cow<'static, str> {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGSYS => "SIGSYS",
        other => return Cow::Owned(format!("unknown signal {}", other)),
    };
    Cow::Borrowed(name)
}

#[derive(Debug)]
struct WorkerExit {
    pid: u32,
    status: std::io::Result<ExitStatus>,
}

#[derive(Debug, Clone, Copy)]
struct WorkerProcess {
    index: usize,
    generation: u64,
}

/// Live child processes, keyed by pid.
#[derive(Debug)]
struct WorkerSet {
    workers: HashMap<u32, WorkerProcess>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
}

impl WorkerSet {
    fn new() -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            workers: HashMap::new(),
            exit_tx,
            exit_rx,
        }
    }

    fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn signal_all(&self, signal: i32) {
        for pid in self.workers.keys() {
            send_signal(*pid, signal);
        }
    }

    fn signal_generation(&self, generation: u64, signal: i32) {
        for (pid, worker) in &self.workers {
            if worker.generation == generation {
                send_signal(*pid, signal);
            }
        }
    }

    /// Remove an exited worker and report how it ended.
    fn record_exit(&mut self, exit: WorkerExit) {
        let Some(worker) = self.workers.remove(&exit.pid) else {
            return;
        };

        match exit.status {
            Ok(status) => {
                let kind = ExitKind::from_status(status);
                metrics::record_worker_exit(kind.label());
                match kind {
                    ExitKind::Clean => tracing::info!(
                        pid = exit.pid,
                        index = worker.index,
                        generation = worker.generation,
                        "{}",
                        kind
                    ),
                    _ => tracing::error!(
                        pid = exit.pid,
                        index = worker.index,
                        generation = worker.generation,
                        "{}",
                        kind
                    ),
                }
            }
            Err(e) => tracing::error!(pid = exit.pid, error = %e, "Failed to wait for worker"),
        }
    }
}

/// Next debounced change, or never when reload is off.
async fn watched_change(
    changes: &mut Option<mpsc::UnboundedReceiver<PathBuf>>,
    debounce: Duration,
) -> Option<PathBuf> {
    match changes {
        Some(changes) => next_change(changes, debounce).await,
        None => std::future::pending().await,
    }
}

fn send_signal(pid: u32, signal: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) on a child pid we spawned and have not reaped yet.
    if unsafe { libc::kill(pid, signal) } != 0 {
        tracing::debug!(
            pid,
            signal = %signal_name(signal),
            error = %std::io::Error::last_os_error(),
            "Failed to signal worker"
        );
    }
}

/// Owns the shared socket and the worker processes.
pub struct Supervisor {
    config: ServerConfig,
    socket: Option<StdTcpListener>,
    listen_fd: i32,
    executable: PathBuf,
    args: Vec<OsString>,
    workers: WorkerSet,
    generation: u64,
}

impl Supervisor {
    /// Bind the listening socket, or adopt the one named by
    /// `FORKSERVE_LISTEN_FD` when this is a reload-continuation run.
    pub fn bind(config: ServerConfig) -> Result<Self, SupervisorError> {
        let inherited = std::env::var(LISTEN_FD_ENV).ok().and_then(|fd| fd.parse().ok());
        let socket = match inherited {
            Some(fd) => {
                tracing::info!(fd, "Reusing inherited listening socket");
                adopt(fd)?
            }
            None => bind_shared(&config.listener)?,
        };

        let listen_fd = socket.as_raw_fd();
        set_inheritable(listen_fd, true).map_err(SupervisorError::Inherit)?;

        Ok(Self {
            config,
            socket: Some(socket),
            listen_fd,
            executable: std::env::current_exe().map_err(SupervisorError::Executable)?,
            args: std::env::args_os().skip(1).collect(),
            workers: WorkerSet::new(),
            generation: 0,
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Supervise workers until a termination signal or until all exit.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let reload = self.config.reload.enabled;
        let mut signals = SupervisorSignals::install(reload).map_err(SupervisorError::Signals)?;

        let (_watcher, mut changes) = if reload {
            let mut paths: Vec<PathBuf> = self.config.reload.watch_paths.iter().map(PathBuf::from).collect();
            paths.push(self.executable.clone());
            let (watcher, changes) = ReloadWatcher::new(paths);
            (Some(watcher.run()?), Some(changes))
        } else {
            (None, None)
        };
        let debounce = Duration::from_millis(self.config.reload.debounce_ms);

        tracing::info!(
            pid = std::process::id(),
            address = ?self.local_addr(),
            workers = self.config.listener.workers,
            reload,
            "Supervisor starting"
        );
        self.spawn_generation()?;

        if !reload {
            // Workers hold their own copies.
            self.socket = None;
        }

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    SupervisorSignal::Terminate(name) => {
                        tracing::info!(signal = name, "Terminating workers");
                        break;
                    }
                    SupervisorSignal::Reload => self.reload("SIGHUP")?,
                },
                Some(path) = watched_change(&mut changes, debounce) => {
                    tracing::info!(path = %path.display(), "Watched file changed");
                    self.reload("file change")?;
                }
                Some(exit) = self.workers.exit_rx.recv() => {
                    self.workers.record_exit(exit);
                    if self.workers.is_empty() {
                        tracing::warn!("All workers exited, supervisor stopping");
                        return Ok(());
                    }
                }
            }
        }

        self.terminate_all().await;
        tracing::info!("Supervisor stopped");
        Ok(())
    }

    fn spawn_generation(&mut self) -> Result<(), SupervisorError> {
        self.generation += 1;
        for index in 0..self.config.listener.workers {
            self.spawn_worker(index)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, index: usize) -> Result<(), SupervisorError> {
        let spawn_error = |source| SupervisorError::Spawn { index, source };

        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .env(ROLE_ENV, WORKER_ROLE)
            .env(LISTEN_FD_ENV, self.listen_fd.to_string())
            .env(WORKER_INDEX_ENV, index.to_string())
            .env(GENERATION_ENV, self.generation.to_string())
            .spawn()
            .map_err(spawn_error)?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_error(std::io::Error::other("worker exited before its pid was read")))?;

        let exit_tx = self.workers.exit_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(WorkerExit { pid, status });
        });

        self.workers.workers.insert(
            pid,
            WorkerProcess {
                index,
                generation: self.generation,
            },
        );
        tracing::info!(pid, index, generation = self.generation, "Worker spawned");
        Ok(())
    }

    /// Start a fresh generation on the same socket, then retire the old one.
    fn reload(&mut self, trigger: &str) -> Result<(), SupervisorError> {
        let previous = self.generation;
        tracing::info!(trigger, generation = previous + 1, "Reloading workers");
        self.spawn_generation()?;
        self.workers.signal_generation(previous, libc::SIGTERM);
        Ok(())
    }

    /// SIGTERM every worker, wait for the drain deadline, then SIGKILL.
    async fn terminate_all(&mut self) {
        self.workers.signal_all(libc::SIGTERM);
        let deadline = Instant::now() + self.config.drain.worker_exit_deadline();

        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.workers.exit_rx.recv()).await {
                Ok(Some(exit)) => self.workers.record_exit(exit),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(remaining = self.workers.workers.len(), "Workers did not exit in time, killing");
                    self.workers.signal_all(libc::SIGKILL);
                    let kill_deadline = Instant::now() + KILL_REAP_TIMEOUT;
                    while !self.workers.is_empty() {
                        match tokio::time::timeout_at(kill_deadline, self.workers.exit_rx.recv()).await {
                            Ok(Some(exit)) => self.workers.record_exit(exit),
                            _ => break,
                        }
                    }
                    break;
                }
            }
        }
    }
}
