//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize logging and validate configuration
//! - Decide this process's role from the coordination variables
//! - Run either the supervisor or a worker to completion
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The same binary is both roles; workers are re-executions of it
//! - The app is built in every process, so route errors surface in the
//!   supervisor before any worker starts

use crate::app::App;
use crate::config::{validate_config, ServerConfig, ValidationError};
use crate::lifecycle::supervisor::{Supervisor, SupervisorError};
use crate::lifecycle::worker::{self, WorkerEnv, WorkerError};
use crate::observability::init_logging;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error("failed to build the supervisor runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Run `app` with `config` in whichever role this process was started as.
///
/// A fresh start becomes the supervisor: it binds the socket and spawns
/// `config.listener.workers` copies of the current executable, which come
/// back through this function as workers.
pub fn run(app: App, config: ServerConfig) -> Result<(), StartupError> {
    init_logging(&config.observability);

    if let Some(env) = WorkerEnv::from_env()? {
        return Ok(worker::run(app, config, env)?);
    }

    validate_config(&config).map_err(StartupError::Validation)?;

    tracing::info!(
        routes = app.router().len(),
        workers = config.listener.workers,
        "forkserve starting"
    );
    drop(app);

    let supervisor = Supervisor::bind(config)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    runtime.block_on(supervisor.run())?;
    Ok(())
}
