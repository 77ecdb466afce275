//! Per-connection protocol engine.
//!
//! # Responsibilities
//! - Read and decode requests off one socket
//! - Dispatch each request to its handler as a separate task
//! - Write responses strictly in request-arrival order
//! - Honor keep-alive, `Connection: close`, HEAD and protocol errors
//! - Obey close / cancel commands from the reaper and drain controller
//!
//! # Design Decisions
//! - Reader and writer halves run concurrently, joined by a FIFO whose
//!   order is the response order
//! - Each parsed request holds one of `pipeline_depth` slots until its
//!   response is written; a slot is taken before more bytes are read, so
//!   a full pipeline stops reading instead of buffering unbounded requests
//! - Handler tasks are aborted when their pipeline entry is dropped, which
//!   is how `pipeline_cancel` unwinds handlers that never yield control back

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::BytesMut;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};

use crate::app::App;
use crate::config::ProtocolConfig;
use crate::http::codec::{ProtocolError, RequestDecoder};
use crate::http::handler::panic_message;
use crate::http::response::protocol_error_response;
use crate::http::{HandlerError, Request, RequestHead, Response};
use crate::net::{ConnCommand, ConnectionHandle};
use crate::observability::metrics;

const INITIAL_READ_BUFFER: usize = 4096;

type HandlerOutcome = Result<Response, HandlerError>;

/// Join handle that aborts its task when dropped.
struct AbortOnDrop(JoinHandle<HandlerOutcome>);

impl Future for AbortOnDrop {
    type Output = Result<HandlerOutcome, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One entry of the outbound pipeline, oldest first.
enum Pending {
    /// Handler running on its own task.
    Dispatched {
        head: Arc<RequestHead>,
        task: AbortOnDrop,
        started: Instant,
    },
    /// Outcome known at dispatch time (no route).
    Ready {
        head: Arc<RequestHead>,
        outcome: HandlerOutcome,
        started: Instant,
    },
    /// Input could not be decoded; answer 400/413 and close.
    Rejected(ProtocolError),
}

/// A pipeline entry together with the depth slot it occupies.
struct Queued {
    pending: Pending,
    slot: OwnedSemaphorePermit,
}

/// Drives a single accepted connection until it closes.
pub struct Connection {
    app: Arc<App>,
    config: ProtocolConfig,
    handle: Arc<ConnectionHandle>,
}

impl Connection {
    pub fn new(app: Arc<App>, config: ProtocolConfig, handle: Arc<ConnectionHandle>) -> Self {
        Self { app, config, handle }
    }

    /// Serve requests until the peer leaves, a protocol error occurs or
    /// the worker closes the connection.
    pub async fn serve(self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let depth = self.config.pipeline_depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        let slots = Arc::new(Semaphore::new(depth));

        let decoder = RequestDecoder::new(&self.config).with_remote_addr(self.handle.peer_addr());

        tokio::join!(
            self.read_loop(reader, decoder, tx, slots),
            self.write_loop(writer, rx),
        );

        self.handle.mark_closed();
        tracing::debug!(connection_id = %self.handle.id(), "Connection finished");
    }

    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        mut decoder: RequestDecoder,
        tx: mpsc::Sender<Queued>,
        slots: Arc<Semaphore>,
    ) {
        let mut commands = self.handle.subscribe();
        let mut buf = BytesMut::with_capacity(INITIAL_READ_BUFFER);

        'read: loop {
            let slot = tokio::select! {
                biased;
                _ = stop_requested(&mut commands) => break 'read,
                slot = Arc::clone(&slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break 'read,
                },
            };
            let permit = tokio::select! {
                biased;
                _ = stop_requested(&mut commands) => break 'read,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'read,
                },
            };

            let request = loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(request)) => break request,
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(
                            connection_id = %self.handle.id(),
                            error = %err,
                            "Protocol error"
                        );
                        metrics::record_protocol_error(err.kind());
                        self.handle.begin_request();
                        permit.send(Queued {
                            pending: Pending::Rejected(err),
                            slot,
                        });
                        break 'read;
                    }
                }
                self.handle.set_phase(decoder.phase());

                let read = tokio::select! {
                    biased;
                    _ = stop_requested(&mut commands) => break 'read,
                    read = reader.read_buf(&mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        if !buf.is_empty() {
                            tracing::debug!(
                                connection_id = %self.handle.id(),
                                buffered = buf.len(),
                                "Peer closed mid-request"
                            );
                        }
                        break 'read;
                    }
                    Ok(_) => self.handle.touch(),
                    Err(e) => {
                        tracing::debug!(connection_id = %self.handle.id(), error = %e, "Read failed");
                        break 'read;
                    }
                }
            };

            self.handle.set_phase(decoder.phase());
            let keep_alive = request.head().keep_alive();
            self.handle.begin_request();
            permit.send(Queued {
                pending: self.dispatch(request),
                slot,
            });

            if !keep_alive {
                break 'read;
            }
        }
    }

    fn dispatch(&self, mut request: Request) -> Pending {
        let head = request.shared_head();
        let started = Instant::now();

        match self.app.router().match_route(head.method(), head.path()) {
            Some(matched) => {
                request.set_params(matched.params);
                let task = tokio::spawn(matched.handler.call(request));
                Pending::Dispatched {
                    head,
                    task: AbortOnDrop(task),
                    started,
                }
            }
            None => Pending::Ready {
                head,
                outcome: Err(HandlerError::NotFound),
                started,
            },
        }
    }

    async fn write_loop(&self, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Queued>) {
        let mut commands = self.handle.subscribe();
        let mut out = BytesMut::with_capacity(INITIAL_READ_BUFFER);
        let mut graceful = true;

        loop {
            let Queued { pending, slot } = tokio::select! {
                biased;
                _ = cancel_requested(&mut commands) => {
                    graceful = false;
                    break;
                }
                next = rx.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let (head, outcome, started) = match pending {
                Pending::Rejected(err) => {
                    let wire = protocol_error_response(err.status(), &err.to_string());
                    self.handle.set_writing(true);
                    let _ = writer.write_all(&wire).await;
                    self.handle.set_writing(false);
                    self.handle.finish_request();
                    break;
                }
                Pending::Ready { head, outcome, started } => (head, outcome, started),
                Pending::Dispatched { head, mut task, started } => {
                    let joined = tokio::select! {
                        biased;
                        _ = cancel_requested(&mut commands) => {
                            graceful = false;
                            break;
                        }
                        joined = &mut task => joined,
                    };
                    (head, flatten(joined), started)
                }
            };

            let response = match outcome {
                Ok(response) => response,
                Err(error) => self.app.errors().resolve(&head, &error),
            };

            // A closing connection announces it on its last queued response.
            // A close that lands after that response was written goes unannounced.
            let closing = *commands.borrow() != ConnCommand::Open && rx.is_empty();
            let keep_alive = head.keep_alive() && !response.wants_close() && !closing;
            out.clear();
            response.encode(head.version(), keep_alive, head.method() == Method::HEAD, &mut out);

            self.handle.set_writing(true);
            let written = tokio::select! {
                biased;
                _ = cancel_requested(&mut commands) => {
                    graceful = false;
                    break;
                }
                written = writer.write_all(&out) => written,
            };
            self.handle.set_writing(false);
            self.handle.finish_request();
            drop(slot);

            let status = response.status().as_u16();
            metrics::record_request(head.method().as_str(), status, started);
            tracing::debug!(
                connection_id = %self.handle.id(),
                method = %head.method(),
                path = %head.path(),
                status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request served"
            );

            if let Err(e) = written {
                tracing::debug!(connection_id = %self.handle.id(), error = %e, "Write failed");
                graceful = false;
                break;
            }
            if !keep_alive {
                break;
            }
        }

        // Reader must stop too, whichever side finished first.
        self.handle.close();
        rx.close();
        let abandoned = std::iter::from_fn(|| rx.try_recv().ok()).count();
        if abandoned > 0 {
            tracing::debug!(
                connection_id = %self.handle.id(),
                abandoned,
                "Pipelined requests dropped with the connection"
            );
        }

        if graceful {
            let _ = writer.shutdown().await;
        }
    }
}

fn flatten(joined: Result<HandlerOutcome, JoinError>) -> HandlerOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic().as_ref()))),
        Err(_) => Err(HandlerError::Cancelled),
    }
}

/// Resolves once the worker asked this connection to stop reading.
async fn stop_requested(commands: &mut watch::Receiver<ConnCommand>) {
    let _ = commands.wait_for(|c| *c != ConnCommand::Open).await;
}

/// Resolves once the worker asked this connection to abandon its pipeline.
async fn cancel_requested(commands: &mut watch::Receiver<ConnCommand>) {
    if commands.wait_for(|c| *c == ConnCommand::Cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::net::ConnectionRegistry;
    use tokio::net::TcpListener;

    async fn slow(request: Request) -> Result<Response, HandlerError> {
        let millis: u64 = request.param("ms").unwrap_or("0").parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Response::text(format!("slept {}", millis)))
    }

    async fn serve_one(app: App, config: ProtocolConfig) -> (TcpStream, Arc<ConnectionHandle>, ConnectionRegistry) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let registry = ConnectionRegistry::new();
        let guard = registry.track(peer);
        let handle = Arc::clone(guard.handle());
        let connection = Connection::new(Arc::new(app), config, Arc::clone(&handle));
        tokio::spawn(async move {
            connection.serve(stream).await;
            drop(guard);
        });
        (client, handle, registry)
    }

    async fn read_to_close(client: &mut TcpStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    fn sleepy_app() -> App {
        App::builder().get("/sleep/{ms}", slow).build().unwrap()
    }

    #[tokio::test]
    async fn pipelined_responses_keep_request_order() {
        let (mut client, _, _) = serve_one(sleepy_app(), ProtocolConfig::default()).await;
        client
            .write_all(
                b"GET /sleep/200 HTTP/1.1\r\n\r\n\
                  GET /sleep/0 HTTP/1.1\r\n\r\n\
                  GET /sleep/10 HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let wire = read_to_close(&mut client).await;
        let first = wire.find("slept 200").unwrap();
        let second = wire.find("slept 0").unwrap();
        let third = wire.find("slept 10").unwrap();
        assert!(first < second && second < third, "{wire}");
    }

    #[tokio::test]
    async fn pipeline_depth_bounds_unwritten_requests() {
        let config = ProtocolConfig {
            pipeline_depth: 1,
            ..ProtocolConfig::default()
        };
        let (mut client, handle, _) = serve_one(sleepy_app(), config).await;
        client
            .write_all(
                b"GET /sleep/100 HTTP/1.1\r\n\r\n\
                  GET /sleep/100 HTTP/1.1\r\n\r\n\
                  GET /sleep/100 HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let watcher = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut max_in_flight = 0;
                while !handle.is_closed() {
                    max_in_flight = max_in_flight.max(handle.in_flight());
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                max_in_flight
            })
        };

        let wire = read_to_close(&mut client).await;
        assert_eq!(wire.matches("slept 100").count(), 3, "{wire}");
        assert_eq!(watcher.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let (mut client, _, _) = serve_one(sleepy_app(), ProtocolConfig::default()).await;
        client.write_all(b"this is not http\r\n\r\n").await.unwrap();

        let wire = read_to_close(&mut client).await;
        assert!(wire.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{wire}");
        assert!(wire.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn head_requests_have_no_body() {
        let app = App::builder()
            .route(Method::HEAD, "/", |_: Request| async { Ok::<_, HandlerError>(Response::text("hidden")) })
            .build()
            .unwrap();
        let (mut client, _, _) = serve_one(app, ProtocolConfig::default()).await;
        client
            .write_all(b"HEAD / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let wire = read_to_close(&mut client).await;
        assert!(wire.contains("Content-Length: 6\r\n"), "{wire}");
        assert!(wire.ends_with("\r\n\r\n"), "{wire}");
    }

    #[tokio::test]
    async fn handler_panics_become_500() {
        async fn explode(_: Request) -> Result<Response, HandlerError> {
            panic!("handler bug")
        }

        let app = App::builder()
            .get("/", explode)
            .build()
            .unwrap();
        let (mut client, _, _) = serve_one(app, ProtocolConfig::default()).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let wire = read_to_close(&mut client).await;
        assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{wire}");
    }

    #[tokio::test]
    async fn close_finishes_the_pipeline_first() {
        let (mut client, handle, registry) = serve_one(sleepy_app(), ProtocolConfig::default()).await;
        client.write_all(b"GET /sleep/100 HTTP/1.1\r\n\r\n").await.unwrap();

        while handle.pipeline_empty() {
            tokio::task::yield_now().await;
        }
        assert!(handle.close());

        let wire = read_to_close(&mut client).await;
        assert!(wire.contains("slept 100"), "{wire}");
        assert!(wire.contains("Connection: close\r\n"), "{wire}");
        tokio::time::timeout(Duration::from_secs(1), registry.wait_empty())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_drops_in_flight_requests() {
        let (mut client, handle, registry) = serve_one(sleepy_app(), ProtocolConfig::default()).await;
        client.write_all(b"GET /sleep/60000 HTTP/1.1\r\n\r\n").await.unwrap();

        while handle.pipeline_empty() {
            tokio::task::yield_now().await;
        }
        assert!(handle.pipeline_cancel());

        let wire = read_to_close(&mut client).await;
        assert!(wire.is_empty(), "{wire}");
        tokio::time::timeout(Duration::from_secs(1), registry.wait_empty())
            .await
            .unwrap();
    }
}
