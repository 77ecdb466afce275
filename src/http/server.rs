//! Per-worker HTTP server.
//!
//! # Responsibilities
//! - Run startup hooks before the first accept
//! - Accept connections and hand each one to the protocol engine
//! - Run the reaper alongside the accept loop
//! - On shutdown: stop accepting, drain, close the listener, run cleanup hooks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::app::App;
use crate::config::ServerConfig;
use crate::http::protocol::Connection;
use crate::http::BoxError;
use crate::lifecycle::{Drain, DrainReport, Reaper, Shutdown};
use crate::net::{ConnectionRegistry, Listener, ListenerError};

/// Time allowed for connection tasks to flush after drain returns.
const CONNECTION_FLUSH_GRACE: Duration = Duration::from_secs(1);
/// Pause after a failed accept (EMFILE and friends).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("startup hook failed: {0}")]
    StartupHook(#[source] BoxError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Serves one worker's share of connections.
pub struct HttpServer {
    app: Arc<App>,
    config: ServerConfig,
    registry: ConnectionRegistry,
}

impl HttpServer {
    /// A root-level `debug = true` in the config turns on the app's debug mode.
    pub fn new(mut app: App, config: ServerConfig) -> Self {
        if config.debug {
            app.set_debug(true);
        }
        Self {
            app: Arc::new(app),
            config,
            registry: ConnectionRegistry::new(),
        }
    }

    /// The live connection set, shared with reaper and drain.
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<DrainReport, ServerError> {
        self.app.run_startup().await.map_err(ServerError::StartupHook)?;

        let local_addr = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(
            address = %local_addr,
            routes = self.app.router().len(),
            debug = self.app.is_debug(),
            "HTTP server starting"
        );

        let background = Shutdown::new();
        let reaper = self.config.reaper.enabled.then(|| {
            let reaper = Reaper::new(self.registry.clone(), &self.config.reaper);
            tokio::spawn(reaper.run(background.subscribe()))
        });

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        let guard = self.registry.track(peer_addr);
                        let connection = Connection::new(
                            Arc::clone(&self.app),
                            self.config.protocol.clone(),
                            Arc::clone(guard.handle()),
                        );
                        tokio::spawn(async move {
                            connection.serve(stream).await;
                            drop(guard);
                            drop(permit);
                        });
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!(connections = self.registry.len(), "Stopped accepting, draining");
        let report = Drain::new(self.registry.clone(), &self.config.drain).run().await;

        if tokio::time::timeout(CONNECTION_FLUSH_GRACE, self.registry.wait_empty())
            .await
            .is_err()
        {
            tracing::warn!(remaining = self.registry.len(), "Connections still open after drain");
        }

        drop(listener);
        background.trigger();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        self.app.run_cleanup().await;
        tracing::info!("HTTP server stopped");
        Ok(report)
    }
}
