//! Client-side CBPP connection.
//!
//! Mirrors the server session in the outbound direction: decoded events
//! become serialized jobs, but the streaming callbacks (header, payload
//! slice, end) are surfaced to the handler instead of being assembled, and
//! inbound control frames are reported through the error-message path.
//!
//! The keep-alive timer starts with the first encoded send. Every tick it
//! either force-shuts the connection (no liveness evidence for two whole
//! periods; any complete inbound data message counts as evidence) or sends
//! a heartbeat control carrying the UTC wall-clock milliseconds.

use std::{
    any::Any,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::{codec::Decoder, sync::CancellationToken};

use crate::{
    codec::{CbppDecoder, CbppEvent, CbppWriter, CodecError, ControlCode},
    job::{CategoryRef, Job, JobDispatcher, JobError},
    metrics,
    outbound::FrameHandle,
    session::HandlerError,
};

/// Sentinel meaning no inbound data message has arrived yet.
const NO_PONG_YET: u64 = u64::MAX;

/// User-supplied callbacks for a client connection.
///
/// Data messages are delivered in streaming form: one header, payload
/// slices with contiguous offsets, one end. All callbacks run serialized
/// on the connection's category.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// A data-message header arrived.
    async fn on_data_message_header(
        &self,
        client: &Arc<Client>,
        message_id: u16,
        payload_size: u64,
    ) -> Result<(), HandlerError>;

    /// A contiguous run of payload bytes arrived.
    async fn on_data_message_payload(
        &self,
        client: &Arc<Client>,
        payload_offset: u64,
        chunk: Bytes,
    ) -> Result<(), HandlerError>;

    /// The data message is complete.
    async fn on_data_message_end(
        &self,
        client: &Arc<Client>,
        payload_size: u64,
    ) -> Result<(), HandlerError>;

    /// An error (or any other control) message arrived from the server.
    async fn on_error_message(
        &self,
        client: &Arc<Client>,
        message_id: u16,
        status_code: i64,
        reason: &str,
    ) -> Result<(), HandlerError> {
        log::info!(
            "client {}: error message from server: message {message_id}, status {status_code}, \
             reason {reason:?}",
            client.remote()
        );
        Ok(())
    }
}

struct ReceiveState {
    decoder: CbppDecoder,
    buffer: BytesMut,
}

/// Client-side half of one CBPP connection.
pub struct Client {
    remote: SocketAddr,
    handler: Arc<dyn ClientHandler>,
    dispatcher: Arc<JobDispatcher>,
    writer: CbppWriter,
    state: Mutex<ReceiveState>,
    keep_alive_interval: Duration,
    epoch: Instant,
    last_pong_ms: AtomicU64,
    keep_alive_started: AtomicBool,
    shutdown: CancellationToken,
}

impl Client {
    /// Create a client over an established connection's outbound handle.
    ///
    /// `keep_alive_interval` must be non-zero; the timer itself is
    /// registered lazily on the first encoded send.
    pub fn new(
        remote: SocketAddr,
        handler: Arc<dyn ClientHandler>,
        dispatcher: Arc<JobDispatcher>,
        handle: FrameHandle,
        keep_alive_interval: Duration,
    ) -> Arc<Self> {
        debug_assert!(!keep_alive_interval.is_zero());
        let client = Arc::new(Self {
            remote,
            handler,
            dispatcher,
            writer: CbppWriter::new(handle),
            state: Mutex::new(ReceiveState {
                decoder: CbppDecoder::new(),
                buffer: BytesMut::new(),
            }),
            keep_alive_interval,
            epoch: Instant::now(),
            last_pong_ms: AtomicU64::new(NO_PONG_YET),
            keep_alive_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        metrics::inc_connections();
        client
    }

    /// Peer address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr { self.remote }

    /// Token the transport glue watches to learn when to close the socket.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Queue a data message for the server.
    ///
    /// Returns whether the outbound queue accepted the frame.
    pub fn send(self: &Arc<Self>, message_id: u16, payload: Bytes) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.ensure_keep_alive();
        let accepted = self.writer.put_data_message(message_id, payload);
        if accepted {
            metrics::inc_frames(metrics::Direction::Outbound);
        }
        accepted
    }

    /// Queue a control message for the server.
    pub fn send_control(
        self: &Arc<Self>,
        code: ControlCode,
        vint_param: i64,
        string_param: &str,
    ) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.ensure_keep_alive();
        self.writer.put_control_message(code, vint_param, string_param)
    }

    /// Feed bytes received from the transport.
    pub fn put_encoded_data(self: &Arc<Self>, data: &[u8]) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.state.lock().expect("client receive state poisoned");
        let ReceiveState { decoder, buffer } = &mut *state;
        buffer.extend_from_slice(data);
        loop {
            match decoder.decode(buffer) {
                Ok(Some(event)) => self.on_event(event),
                Ok(None) => break,
                Err(CodecError::Protocol(violation)) => {
                    log::info!(
                        "client {}: protocol violation from server: {violation}",
                        self.remote
                    );
                    metrics::inc_protocol_errors();
                    self.force_shutdown();
                    break;
                }
                Err(CodecError::Io(e)) => {
                    log::info!("client {}: receive failure: {e}", self.remote);
                    self.force_shutdown();
                    break;
                }
            }
        }
    }

    /// Tear the connection down immediately in both directions.
    pub fn force_shutdown(&self) { self.shutdown.cancel(); }

    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool { self.shutdown.is_cancelled() }

    fn on_event(self: &Arc<Self>, event: CbppEvent) {
        let client = Arc::downgrade(self);
        match event {
            CbppEvent::DataHeader {
                message_id,
                payload_size,
            } => self.dispatcher.enqueue(Box::new(DataMessageHeaderJob {
                client,
                message_id,
                payload_size,
            })),
            CbppEvent::DataPayload { offset, chunk } => {
                self.dispatcher.enqueue(Box::new(DataMessagePayloadJob {
                    client,
                    payload_offset: offset,
                    chunk,
                }));
            }
            CbppEvent::DataEnd { payload_size } => {
                metrics::inc_frames(metrics::Direction::Inbound);
                self.dispatcher.enqueue(Box::new(DataMessageEndJob {
                    client,
                    payload_size,
                }));
            }
            // Control messages share the error-message path: an error
            // reply is a control frame whose code is the offending message
            // id, and the core cannot tell other codes apart from it.
            CbppEvent::Control {
                code,
                vint_param,
                string_param,
            } => self.dispatcher.enqueue(Box::new(ErrorMessageJob {
                client,
                message_id: code.0 as u16,
                status_code: vint_param,
                reason: string_param,
            })),
        }
    }

    fn now_ms(&self) -> u64 { self.epoch.elapsed().as_millis() as u64 }

    fn refresh_last_pong(&self) {
        self.last_pong_ms.store(self.now_ms(), Ordering::Release);
    }

    fn ensure_keep_alive(self: &Arc<Self>) {
        if self.keep_alive_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.keep_alive_interval;
        let started_ms = self.now_ms();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else { return };
                if client.is_shutdown() {
                    return;
                }
                client.keep_alive_tick(started_ms);
            }
        });
    }

    fn keep_alive_tick(self: &Arc<Self>, started_ms: u64) {
        let now_ms = self.now_ms();
        let period_ms = self.keep_alive_interval.as_millis() as u64;
        let last_pong = self.last_pong_ms.load(Ordering::Acquire);
        // Until the first message arrives, liveness is measured from the
        // moment the keep-alive was registered.
        let reference = if last_pong == NO_PONG_YET {
            started_ms
        } else {
            last_pong
        };
        if now_ms.saturating_sub(reference) >= period_ms * 2 {
            log::info!(
                "client {}: no liveness evidence for two keep-alive intervals; shutting down",
                self.remote
            );
            self.force_shutdown();
            return;
        }
        let utc_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.send_control(ControlCode::HEARTBEAT, 0, &utc_ms.to_string());
    }
}

impl Drop for Client {
    fn drop(&mut self) { metrics::dec_connections(); }
}

fn client_category(client: &Weak<Client>) -> CategoryRef {
    let weak: Weak<dyn Any + Send + Sync> = client.clone();
    weak
}

fn settle_outcome(client: &Arc<Client>, result: Result<(), HandlerError>) -> Result<(), JobError> {
    match result {
        Ok(()) => Ok(()),
        Err(HandlerError::TryAgainLater) => Err(JobError::TryAgainLater),
        Err(e) => {
            log::info!("client {}: callback failed: {e}", client.remote());
            metrics::inc_handler_errors();
            client.force_shutdown();
            Err(JobError::Failed(Box::new(e)))
        }
    }
}

struct DataMessageHeaderJob {
    client: Weak<Client>,
    message_id: u16,
    payload_size: u64,
}

#[async_trait]
impl Job for DataMessageHeaderJob {
    fn category(&self) -> CategoryRef { client_category(&self.client) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let result = client
            .handler
            .on_data_message_header(&client, self.message_id, self.payload_size)
            .await;
        settle_outcome(&client, result)
    }
}

struct DataMessagePayloadJob {
    client: Weak<Client>,
    payload_offset: u64,
    chunk: Bytes,
}

#[async_trait]
impl Job for DataMessagePayloadJob {
    fn category(&self) -> CategoryRef { client_category(&self.client) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let result = client
            .handler
            .on_data_message_payload(&client, self.payload_offset, self.chunk.clone())
            .await;
        settle_outcome(&client, result)
    }
}

struct DataMessageEndJob {
    client: Weak<Client>,
    payload_size: u64,
}

#[async_trait]
impl Job for DataMessageEndJob {
    fn category(&self) -> CategoryRef { client_category(&self.client) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let result = client
            .handler
            .on_data_message_end(&client, self.payload_size)
            .await;
        if result.is_ok() {
            // Any complete inbound data message counts as liveness
            // evidence, not just control replies.
            client.refresh_last_pong();
        }
        settle_outcome(&client, result)
    }
}

struct ErrorMessageJob {
    client: Weak<Client>,
    message_id: u16,
    status_code: i64,
    reason: String,
}

#[async_trait]
impl Job for ErrorMessageJob {
    fn category(&self) -> CategoryRef { client_category(&self.client) }

    async fn perform(&self) -> Result<(), JobError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let result = client
            .handler
            .on_error_message(&client, self.message_id, self.status_code, &self.reason)
            .await;
        settle_outcome(&client, result)
    }
}
