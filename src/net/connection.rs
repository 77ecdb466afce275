//! Connection state and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Expose each connection's state tag, pipeline depth and idle clock
//! - Deliver close / cancel commands from the reaper and drain controller
//! - Keep the worker's registry of live connections
//!
//! # Design Decisions
//! - The protocol engine owns the socket; everyone else holds a
//!   [`ConnectionHandle`] and talks to it through a watch channel
//! - Commands only escalate (`Open → Close → Cancel`), so repeating one is a no-op
//! - Registration is tied to a guard; dropping it removes the entry even if
//!   the connection task panics

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::http::codec::DecodePhase;
use crate::observability::metrics;

/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a complete request line and headers.
    AwaitHead,
    /// Head parsed, buffering a Content-Length body.
    ParsingBody,
    /// At least one request is with its handler.
    Dispatched,
    /// A response is being written.
    Writing,
    Closed,
}

/// Instruction from the worker to a connection's engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnCommand {
    Open,
    /// Stop reading; finish writing what is already in the pipeline.
    Close,
    /// Abandon the pipeline and drop the socket now.
    Cancel,
}

const PHASE_AWAIT_HEAD: u8 = 0;
const PHASE_PARSING_BODY: u8 = 1;

/// Shared view of one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    phase: AtomicU8,
    in_flight: AtomicUsize,
    writing: AtomicBool,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    commands: watch::Sender<ConnCommand>,
}

impl ConnectionHandle {
    fn new(peer_addr: SocketAddr) -> Self {
        let (commands, _) = watch::channel(ConnCommand::Open);
        Self {
            id: ConnectionId::new(),
            peer_addr,
            phase: AtomicU8::new(PHASE_AWAIT_HEAD),
            in_flight: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            commands,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True iff no request is parsed but still unanswered.
    ///
    /// Bytes buffered for a request whose head is incomplete do not count.
    pub fn pipeline_empty(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else if self.writing.load(Ordering::Acquire) {
            ConnectionState::Writing
        } else if !self.pipeline_empty() {
            ConnectionState::Dispatched
        } else if self.phase.load(Ordering::Acquire) == PHASE_PARSING_BODY {
            ConnectionState::ParsingBody
        } else {
            ConnectionState::AwaitHead
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time since the last byte was read or a response was written.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.activity())
    }

    /// Ask the engine to stop reading and close once the pipeline is written.
    ///
    /// Returns `true` if this call changed the connection's command.
    pub fn close(&self) -> bool {
        self.escalate(ConnCommand::Close)
    }

    /// Abort every in-flight handler and drop the socket without responses.
    pub fn pipeline_cancel(&self) -> bool {
        self.escalate(ConnCommand::Cancel)
    }

    pub fn command(&self) -> ConnCommand {
        *self.commands.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnCommand> {
        self.commands.subscribe()
    }

    pub(crate) fn touch(&self) {
        *self.activity() = Instant::now();
    }

    pub(crate) fn set_phase(&self, phase: DecodePhase) {
        let raw = match phase {
            DecodePhase::AwaitHead => PHASE_AWAIT_HEAD,
            DecodePhase::ParsingBody => PHASE_PARSING_BODY,
        };
        self.phase.store(raw, Ordering::Release);
    }

    pub(crate) fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_request(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.touch();
    }

    pub(crate) fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.writing.store(false, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
    }

    fn escalate(&self, target: ConnCommand) -> bool {
        if self.is_closed() {
            return false;
        }
        self.commands.send_if_modified(|current| {
            if *current < target {
                *current = target;
                true
            } else {
                false
            }
        })
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    emptied: Notify,
}

/// Live connections of one worker, shared by the accept loop, reaper and drain.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The returned guard deregisters on drop.
    pub fn track(&self, peer_addr: SocketAddr) -> ConnectionGuard {
        let handle = Arc::new(ConnectionHandle::new(peer_addr));
        self.inner.connections.insert(handle.id(), Arc::clone(&handle));
        metrics::connection_opened();
        tracing::trace!(connection_id = %handle.id(), peer_addr = %peer_addr, "Connection tracked");
        ConnectionGuard {
            handle,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Point-in-time copy of the live connections.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Resolve once no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.inner.emptied.notified();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct ConnectionGuard {
    handle: Arc<ConnectionHandle>,
    registry: Arc<RegistryInner>,
}

impl ConnectionGuard {
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }
}

impl Deref for ConnectionGuard {
    type Target = ConnectionHandle;

    fn deref(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.handle.mark_closed();
        self.registry.connections.remove(&self.handle.id());
        metrics::connection_closed();
        if self.registry.connections.is_empty() {
            self.registry.emptied.notify_waiters();
        }
        tracing::trace!(connection_id = %self.handle.id(), "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn registry_tracks_guards() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let guard1 = registry.track(peer());
        let guard2 = registry.track(peer());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(guard1.id()).is_some());

        let handle = Arc::clone(guard1.handle());
        drop(guard1);
        assert_eq!(registry.len(), 1);
        assert!(handle.is_closed());

        drop(guard2);
        assert!(registry.is_empty());
    }

    #[test]
    fn state_follows_pipeline() {
        let registry = ConnectionRegistry::new();
        let conn = registry.track(peer());
        assert_eq!(conn.state(), ConnectionState::AwaitHead);

        conn.set_phase(DecodePhase::ParsingBody);
        assert_eq!(conn.state(), ConnectionState::ParsingBody);

        conn.begin_request();
        assert!(!conn.pipeline_empty());
        assert_eq!(conn.state(), ConnectionState::Dispatched);

        conn.set_writing(true);
        assert_eq!(conn.state(), ConnectionState::Writing);
        conn.set_writing(false);
        conn.finish_request();
        conn.set_phase(DecodePhase::AwaitHead);
        assert!(conn.pipeline_empty());
        assert_eq!(conn.state(), ConnectionState::AwaitHead);

        // Never underflows.
        conn.finish_request();
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn commands_only_escalate() {
        let registry = ConnectionRegistry::new();
        let conn = registry.track(peer());
        let rx = conn.subscribe();

        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(*rx.borrow(), ConnCommand::Close);

        assert!(conn.pipeline_cancel());
        assert!(!conn.close());
        assert_eq!(conn.command(), ConnCommand::Cancel);
    }

    #[test]
    fn closed_connections_ignore_commands() {
        let registry = ConnectionRegistry::new();
        let conn = registry.track(peer());
        conn.mark_closed();
        assert!(!conn.close());
        assert!(!conn.pipeline_cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_resets_on_activity() {
        let registry = ConnectionRegistry::new();
        let conn = registry.track(peer());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_secs(30));

        conn.touch();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn wait_empty_resolves_after_last_guard() {
        let registry = ConnectionRegistry::new();
        let guard = registry.track(peer());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
