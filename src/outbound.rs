//! Prioritized queues for outbound frames on one connection.
//!
//! Encoded control frames (heartbeats, error replies) travel on the urgent
//! channel; data frames queue behind them. Producers hold a cloneable
//! [`FrameHandle`]; the connection's transport glue drains both queues
//! through [`FrameQueues::drain`], which favours the control channel but
//! yields to data traffic after a configurable burst so a chatty control
//! stream cannot starve replies. Frames are delivered in FIFO order within
//! each channel.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use leaky_bucket::RateLimiter;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Default maximum pushes allowed per second when no custom rate is given.
const DEFAULT_PUSH_RATE: usize = 100;

/// Channel a frame was queued on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePriority {
    /// Control subchannel; drained first.
    Control,
    /// Data messages.
    Data,
}

/// Errors that can occur when queuing a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The queue was at capacity.
    QueueFull,
    /// The draining end of the queue has been dropped.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => f.write_str("outbound queue full"),
            Self::Closed => f.write_str("outbound queue closed"),
        }
    }
}

impl std::error::Error for SendError {}

pub(crate) struct FrameHandleInner {
    control_tx: mpsc::Sender<Bytes>,
    data_tx: mpsc::Sender<Bytes>,
    limiter: Option<RateLimiter>,
}

/// Cloneable producer handle for a connection's outbound queues.
#[derive(Clone)]
pub struct FrameHandle(Arc<FrameHandleInner>);

impl FrameHandle {
    /// Queue an encoded control frame, waiting for rate-limit tokens and
    /// queue space.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the draining end has been dropped.
    pub async fn send_control(&self, frame: Bytes) -> Result<(), SendError> {
        if let Some(ref limiter) = self.0.limiter {
            limiter.acquire(1).await;
        }
        self.0
            .control_tx
            .send(frame)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Queue an encoded data frame, waiting for rate-limit tokens and
    /// queue space.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the draining end has been dropped.
    pub async fn send_data(&self, frame: Bytes) -> Result<(), SendError> {
        if let Some(ref limiter) = self.0.limiter {
            limiter.acquire(1).await;
        }
        self.0
            .data_tx
            .send(frame)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Queue a control frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] when at capacity and
    /// [`SendError::Closed`] when the draining end is gone.
    pub fn try_send_control(&self, frame: Bytes) -> Result<(), SendError> {
        Self::try_send(&self.0.control_tx, frame)
    }

    /// Queue a data frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] when at capacity and
    /// [`SendError::Closed`] when the draining end is gone.
    pub fn try_send_data(&self, frame: Bytes) -> Result<(), SendError> {
        Self::try_send(&self.0.data_tx, frame)
    }

    fn try_send(tx: &mpsc::Sender<Bytes>, frame: Bytes) -> Result<(), SendError> {
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Downgrade to a `Weak` reference for storage in a registry.
    #[must_use]
    pub(crate) fn downgrade(&self) -> Weak<FrameHandleInner> { Arc::downgrade(&self.0) }
}

/// Number of consecutive control frames written before the data queue is
/// offered a slot.
const MAX_CONTROL_BEFORE_DATA: usize = 8;

/// Receiver ends of a connection's outbound queues.
pub struct FrameQueues {
    control_rx: mpsc::Receiver<Bytes>,
    data_rx: mpsc::Receiver<Bytes>,
}

impl FrameQueues {
    /// Create queues with the given bounds and the default push rate.
    #[must_use]
    pub fn bounded(control_capacity: usize, data_capacity: usize) -> (Self, FrameHandle) {
        Self::bounded_with_rate(control_capacity, data_capacity, Some(DEFAULT_PUSH_RATE))
    }

    /// Create queues without rate limiting.
    #[must_use]
    pub fn bounded_unlimited(control_capacity: usize, data_capacity: usize) -> (Self, FrameHandle) {
        Self::bounded_with_rate(control_capacity, data_capacity, None)
    }

    /// Create queues with a custom rate limit in pushes per second, or
    /// `None` to disable limiting.
    #[must_use]
    pub fn bounded_with_rate(
        control_capacity: usize,
        data_capacity: usize,
        rate: Option<usize>,
    ) -> (Self, FrameHandle) {
        let (control_tx, control_rx) = mpsc::channel(control_capacity);
        let (data_tx, data_rx) = mpsc::channel(data_capacity);
        let limiter = rate.map(|r| {
            RateLimiter::builder()
                .initial(r)
                .refill(r)
                .interval(Duration::from_secs(1))
                .max(r)
                .build()
        });
        (
            Self {
                control_rx,
                data_rx,
            },
            FrameHandle(Arc::new(FrameHandleInner {
                control_tx,
                data_tx,
                limiter,
            })),
        )
    }

    /// Receive the next frame, preferring the control channel.
    ///
    /// Returns `None` when both queues are closed and empty.
    pub async fn recv(&mut self) -> Option<(FramePriority, Bytes)> {
        tokio::select! {
            biased;
            res = self.control_rx.recv() => res.map(|f| (FramePriority::Control, f)),
            res = self.data_rx.recv() => res.map(|f| (FramePriority::Data, f)),
        }
    }

    /// Close both receivers so no further frames are accepted.
    pub fn close(&mut self) {
        self.control_rx.close();
        self.data_rx.close();
    }

    /// Drain both queues into `writer` until shutdown.
    ///
    /// Control frames are written first, yielding one data slot after
    /// [`MAX_CONTROL_BEFORE_DATA`] consecutive control frames. When
    /// `shutdown` fires, the queues stop accepting new frames, everything
    /// already buffered is flushed, and the drain returns. This is what
    /// lets an error reply queued just before shutdown still reach the
    /// peer.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`std::io::Error`] if a write fails.
    pub async fn drain<W>(
        mut self,
        writer: &mut W,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut control_burst = 0usize;
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    self.close();
                    self.flush_remaining(writer).await?;
                    return Ok(());
                }

                res = self.control_rx.recv() => {
                    let Some(frame) = res else { break };
                    writer.write_all(&frame).await?;
                    control_burst += 1;
                    if control_burst >= MAX_CONTROL_BEFORE_DATA {
                        control_burst = 0;
                        if let Ok(frame) = self.data_rx.try_recv() {
                            writer.write_all(&frame).await?;
                        }
                    }
                }

                res = self.data_rx.recv() => {
                    let Some(frame) = res else { break };
                    writer.write_all(&frame).await?;
                    control_burst = 0;
                }
            }
            writer.flush().await?;
        }
        self.flush_remaining(writer).await
    }

    async fn flush_remaining<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Ok(frame) = self.control_rx.try_recv() {
            writer.write_all(&frame).await?;
        }
        while let Ok(frame) = self.data_rx.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::{FramePriority, FrameQueues, SendError};

    #[tokio::test]
    async fn control_frames_are_received_first() {
        let (mut queues, handle) = FrameQueues::bounded_unlimited(4, 4);
        handle.send_data(Bytes::from_static(b"data")).await.unwrap();
        handle
            .send_control(Bytes::from_static(b"ctl"))
            .await
            .unwrap();

        let (priority, frame) = queues.recv().await.expect("frame");
        assert_eq!(priority, FramePriority::Control);
        assert_eq!(frame.as_ref(), b"ctl");
    }

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let (_queues, handle) = FrameQueues::bounded_unlimited(1, 1);
        handle.try_send_control(Bytes::from_static(b"a")).unwrap();
        assert_eq!(
            handle.try_send_control(Bytes::from_static(b"b")),
            Err(SendError::QueueFull)
        );
    }

    #[tokio::test]
    async fn try_send_reports_closed_queue() {
        let (mut queues, handle) = FrameQueues::bounded_unlimited(1, 1);
        queues.close();
        assert_eq!(
            handle.try_send_data(Bytes::from_static(b"a")),
            Err(SendError::Closed)
        );
    }

    #[tokio::test]
    async fn drain_flushes_buffered_frames_on_shutdown() {
        let (queues, handle) = FrameQueues::bounded_unlimited(4, 4);
        handle.try_send_data(Bytes::from_static(b"payload")).unwrap();
        handle.try_send_control(Bytes::from_static(b"urgent")).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut sink = Vec::new();
        queues
            .drain(&mut sink, shutdown)
            .await
            .expect("drain succeeds");
        // Both frames reach the wire even though shutdown fired first,
        // control ahead of data.
        assert_eq!(sink, b"urgentpayload");
    }

    #[tokio::test]
    async fn drain_exits_when_all_handles_are_dropped() {
        let (queues, handle) = FrameQueues::bounded_unlimited(4, 4);
        handle.try_send_data(Bytes::from_static(b"bye")).unwrap();
        drop(handle);

        let mut sink = Vec::new();
        queues
            .drain(&mut sink, CancellationToken::new())
            .await
            .expect("drain succeeds");
        assert_eq!(sink, b"bye");
    }
}
