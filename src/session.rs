//! Server-side CBPP session.
//!
//! A `Session` owns the receive half of one accepted connection: bytes from
//! the transport are fed to the streaming decoder, and every decoded event
//! becomes one job on the connection's category so that user callbacks run
//! strictly serialized. Replies and error reports flow out through the
//! connection's prioritized outbound queues.
//!
//! Shutdown is two flags plus a token: `shutdown_read` stops the decoder,
//! `shutdown_write` stops new data frames, and once both are set (and no
//! delayed-shutdown guard is outstanding) the cancellation token fires,
//! which tells the transport glue to flush and close the socket.

use std::{
    any::Any,
    error::Error,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::{codec::Decoder, sync::CancellationToken};

use crate::{
    codec::{
        CbppDecoder, CbppEvent, CbppWriter, CodecError, ControlCode, ProtocolViolation, StatusCode,
    },
    job::{CategoryRef, Job, JobDispatcher, JobError},
    metrics,
    outbound::FrameHandle,
    registry::ConnectionId,
};

/// Default acceptance bound for one request payload (16 MiB).
pub const DEFAULT_MAX_REQUEST_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Error returned from user callbacks.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A protocol-level rejection; the status and reason are reported to
    /// the peer.
    #[error("{0}")]
    Protocol(#[from] ProtocolViolation),

    /// Cooperative signal requesting re-execution of the current job.
    #[error("try again later")]
    TryAgainLater,

    /// Any other failure; surfaced to the peer as an internal error.
    #[error(transparent)]
    Other(#[from] Box<dyn Error + Send + Sync>),
}

/// User-supplied request dispatch for a server session.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Handle one complete data message.
    ///
    /// Runs on the connection's category: at most one callback per session
    /// is in flight at any moment, in arrival order.
    async fn on_request(
        &self,
        session: &Arc<Session>,
        message_id: u16,
        payload: Bytes,
    ) -> Result<(), HandlerError>;
}

struct Assembly {
    message_id: u16,
    payload: BytesMut,
}

struct ReceiveState {
    decoder: CbppDecoder,
    buffer: BytesMut,
    assembly: Option<Assembly>,
}

/// Server-side half of one CBPP connection.
pub struct Session {
    id: ConnectionId,
    remote: SocketAddr,
    keep_alive_timeout: Duration,
    handler: Arc<dyn SessionHandler>,
    dispatcher: Arc<JobDispatcher>,
    writer: CbppWriter,
    state: Mutex<ReceiveState>,
    idle_deadline: watch::Sender<Option<Instant>>,
    read_shut: AtomicBool,
    write_shut: AtomicBool,
    shutdown_holds: AtomicUsize,
    shutdown: CancellationToken,
}

impl Session {
    /// Create a session over an accepted connection's outbound handle.
    ///
    /// `keep_alive_timeout` is the idle bound re-armed after every
    /// successfully handled request (`cbpp_keep_alive_timeout`); the
    /// session force-shuts when it expires.
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        handler: Arc<dyn SessionHandler>,
        dispatcher: Arc<JobDispatcher>,
        handle: FrameHandle,
        keep_alive_timeout: Duration,
    ) -> Arc<Self> {
        let (idle_tx, idle_rx) = watch::channel(None);
        let session = Arc::new(Self {
            id,
            remote,
            keep_alive_timeout,
            handler,
            dispatcher,
            writer: CbppWriter::new(handle),
            state: Mutex::new(ReceiveState {
                decoder: CbppDecoder::new().with_max_payload_size(DEFAULT_MAX_REQUEST_PAYLOAD),
                buffer: BytesMut::new(),
                assembly: None,
            }),
            idle_deadline: idle_tx,
            read_shut: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            shutdown_holds: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        metrics::inc_connections();
        tokio::spawn(idle_watchdog(Arc::downgrade(&session), idle_rx));
        session
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Peer address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr { self.remote }

    /// Token the transport glue watches to learn when to close the socket.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Re-arm the idle timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.idle_deadline.send(Some(Instant::now() + timeout));
    }

    /// Feed bytes received from the transport.
    ///
    /// Decoded events are enqueued as jobs on this session's category; a
    /// structural violation schedules a final error reply and shuts the
    /// connection in both directions.
    pub fn put_encoded_data(self: &Arc<Self>, data: &[u8]) {
        if self.read_shut.load(Ordering::Acquire) {
            log::trace!("session {}: discarding {} bytes after read shutdown", self.id, data.len());
            return;
        }
        let mut state = self.state.lock().expect("session receive state poisoned");
        let ReceiveState {
            decoder,
            buffer,
            assembly,
        } = &mut *state;
        buffer.extend_from_slice(data);
        loop {
            match decoder.decode(buffer) {
                Ok(Some(event)) => self.on_event(event, assembly),
                Ok(None) => break,
                Err(CodecError::Protocol(violation)) => {
                    self.on_reader_error(decoder.current_message_id(), violation);
                    break;
                }
                Err(CodecError::Io(e)) => {
                    self.on_reader_error(
                        decoder.current_message_id(),
                        ProtocolViolation::new(StatusCode::BadMessage, e.to_string()),
                    );
                    break;
                }
            }
            if self.read_shut.load(Ordering::Acquire) {
                break;
            }
        }
    }

    fn on_event(self: &Arc<Self>, event: CbppEvent, assembly: &mut Option<Assembly>) {
        match event {
            CbppEvent::DataHeader {
                message_id,
                payload_size,
            } => {
                let capacity = payload_size.min(64 * 1024) as usize;
                *assembly = Some(Assembly {
                    message_id,
                    payload: BytesMut::with_capacity(capacity),
                });
            }
            CbppEvent::DataPayload { chunk, .. } => {
                if let Some(assembly) = assembly {
                    assembly.payload.extend_from_slice(&chunk);
                }
            }
            CbppEvent::DataEnd { .. } => {
                let Some(Assembly {
                    message_id,
                    payload,
                }) = assembly.take()
                else {
                    return;
                };
                metrics::inc_frames(metrics::Direction::Inbound);
                self.dispatcher.enqueue(Box::new(RequestJob {
                    session: Arc::downgrade(self),
                    message_id,
                    payload: payload.freeze(),
                }));
            }
            CbppEvent::Control {
                code,
                vint_param,
                string_param,
            } => {
                self.dispatcher.enqueue(Box::new(ControlJob {
                    session: Arc::downgrade(self),
                    code,
                    vint_param,
                    string_param,
                }));
            }
        }
    }

    fn on_reader_error(self: &Arc<Self>, message_id: u16, violation: ProtocolViolation) {
        log::info!(
            "session {}: protocol violation on message {message_id}: {violation}",
            self.id
        );
        metrics::inc_protocol_errors();
        self.dispatcher.enqueue(Box::new(ErrorJob {
            session: Arc::downgrade(self),
            _guard: DelayedShutdownGuard::new(Arc::clone(self)),
            message_id,
            status: violation.status,
            reason: violation.reason,
        }));
        self.shutdown_read();
        self.shutdown_write();
    }

    /// Queue a data message for the peer.
    ///
    /// Returns whether the outbound queue accepted the frame; false after
    /// write shutdown.
    pub fn send(&self, message_id: u16, payload: Bytes) -> bool {
        if self.write_shut.load(Ordering::Acquire) {
            return false;
        }
        let accepted = self.writer.put_data_message(message_id, payload);
        if accepted {
            metrics::inc_frames(metrics::Direction::Outbound);
        }
        accepted
    }

    /// Queue an error report for the peer.
    ///
    /// Deliberately ignores write shutdown: the error reply scheduled
    /// alongside a shutdown must still reach the wire.
    pub fn send_error(&self, message_id: u16, status: StatusCode, reason: &str) -> bool {
        self.writer
            .put_control_message(ControlCode(i64::from(message_id)), status.as_i64(), reason)
    }

    /// Stop accepting inbound bytes.
    pub fn shutdown_read(&self) {
        self.read_shut.store(true, Ordering::Release);
        self.maybe_close();
    }

    /// Stop accepting outbound data messages.
    pub fn shutdown_write(&self) {
        self.write_shut.store(true, Ordering::Release);
        self.maybe_close();
    }

    /// Tear the connection down immediately in both directions.
    pub fn force_shutdown(&self) {
        self.read_shut.store(true, Ordering::Release);
        self.write_shut.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    /// Whether both directions have been shut.
    #[must_use]
    pub fn is_shutdown(&self) -> bool { self.shutdown.is_cancelled() }

    fn maybe_close(&self) {
        if self.read_shut.load(Ordering::Acquire)
            && self.write_shut.load(Ordering::Acquire)
            && self.shutdown_holds.load(Ordering::Acquire) == 0
        {
            self.shutdown.cancel();
        }
    }

    fn on_control(&self, code: ControlCode, vint_param: i64, string_param: &str) {
        match code {
            ControlCode::HEARTBEAT => {
                log::trace!("session {}: heartbeat from {}", self.id, self.remote);
                self.set_timeout(self.keep_alive_timeout);
            }
            unknown => {
                // The peer sent a control code this server never
                // registered; echo it back and hang up.
                log::warn!("session {}: unknown control code {unknown}", self.id);
                self.writer
                    .put_control_message(unknown, vint_param, string_param);
                self.shutdown_read();
                self.shutdown_write();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) { metrics::dec_connections(); }
}

/// Holds the final close of a session open until dropped.
///
/// Attached to jobs that must be given a chance to flush a reply (the
/// error job scheduled by a reader-level violation) so the cancellation
/// token fires only after the reply has been queued.
struct DelayedShutdownGuard {
    session: Arc<Session>,
}

impl DelayedShutdownGuard {
    fn new(session: Arc<Session>) -> Self {
        session.shutdown_holds.fetch_add(1, Ordering::AcqRel);
        Self { session }
    }
}

impl Drop for DelayedShutdownGuard {
    fn drop(&mut self) {
        self.session.shutdown_holds.fetch_sub(1, Ordering::AcqRel);
        self.session.maybe_close();
    }
}

fn session_category(session: &Weak<Session>) -> CategoryRef {
    let weak: Weak<dyn Any + Send + Sync> = session.clone();
    weak
}

struct RequestJob {
    session: Weak<Session>,
    message_id: u16,
    payload: Bytes,
}

#[async_trait]
impl Job for RequestJob {
    fn category(&self) -> CategoryRef { session_category(&self.session) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        log::debug!(
            "session {}: dispatching message {} ({} bytes)",
            session.id,
            self.message_id,
            self.payload.len()
        );
        match session
            .handler
            .on_request(&session, self.message_id, self.payload.clone())
            .await
        {
            Ok(()) => {
                session.set_timeout(session.keep_alive_timeout);
                Ok(())
            }
            Err(HandlerError::TryAgainLater) => Err(JobError::TryAgainLater),
            Err(HandlerError::Protocol(violation)) => {
                log::info!(
                    "session {}: request {} rejected: {violation}",
                    session.id,
                    self.message_id
                );
                metrics::inc_protocol_errors();
                session.send_error(self.message_id, violation.status, &violation.reason);
                session.shutdown_read();
                session.shutdown_write();
                Ok(())
            }
            Err(HandlerError::Other(e)) => {
                log::info!(
                    "session {}: request {} failed: {e}",
                    session.id,
                    self.message_id
                );
                metrics::inc_handler_errors();
                session.send_error(self.message_id, StatusCode::InternalError, &e.to_string());
                session.shutdown_read();
                session.shutdown_write();
                Ok(())
            }
        }
    }
}

struct ControlJob {
    session: Weak<Session>,
    code: ControlCode,
    vint_param: i64,
    string_param: String,
}

#[async_trait]
impl Job for ControlJob {
    fn category(&self) -> CategoryRef { session_category(&self.session) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.on_control(self.code, self.vint_param, &self.string_param);
        Ok(())
    }
}

struct ErrorJob {
    session: Weak<Session>,
    _guard: DelayedShutdownGuard,
    message_id: u16,
    status: StatusCode,
    reason: String,
}

#[async_trait]
impl Job for ErrorJob {
    fn category(&self) -> CategoryRef { session_category(&self.session) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.send_error(self.message_id, self.status, &self.reason);
        Ok(())
    }
}

async fn idle_watchdog(
    session: Weak<Session>,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        match deadline {
            None => {
                if deadline_rx.changed().await.is_err() {
                    return;
                }
            }
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(at) => {
                        let Some(session) = session.upgrade() else { return };
                        if *deadline_rx.borrow() == Some(at) {
                            log::info!("session {}: idle timeout expired", session.id);
                            session.force_shutdown();
                            return;
                        }
                    }
                    res = deadline_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
