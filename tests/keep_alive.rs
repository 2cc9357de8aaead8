//! Client keep-alive behaviour under virtual time.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use seawire::{
    client::{Client, ClientHandler},
    codec::{CbppDecoder, CbppEncoder, CbppEvent, CbppFrame, ControlCode},
    job::JobDispatcher,
    outbound::{FrameQueues, FramePriority},
    session::HandlerError,
};

struct QuietHandler;

#[async_trait]
impl ClientHandler for QuietHandler {
    async fn on_data_message_header(
        &self,
        _client: &Arc<Client>,
        _message_id: u16,
        _payload_size: u64,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_data_message_payload(
        &self,
        _client: &Arc<Client>,
        _payload_offset: u64,
        _chunk: Bytes,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_data_message_end(
        &self,
        _client: &Arc<Client>,
        _payload_size: u64,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn new_client(period: Duration) -> (Arc<Client>, FrameQueues) {
    let (queues, handle) = FrameQueues::bounded_unlimited(16, 16);
    let client = Client::new(
        "127.0.0.1:7500".parse().expect("addr"),
        Arc::new(QuietHandler),
        JobDispatcher::new(),
        handle,
        period,
    );
    (client, queues)
}

fn decode_frame(frame: &[u8]) -> CbppEvent {
    let mut src = BytesMut::from(frame);
    CbppDecoder::new()
        .decode(&mut src)
        .expect("well-formed frame")
        .expect("complete frame")
}

/// Drain whatever is currently queued, returning decoded control events.
fn drain_controls(queues: &mut FrameQueues) -> Vec<CbppEvent> {
    let mut out = Vec::new();
    loop {
        let polled = futures::FutureExt::now_or_never(queues.recv());
        match polled {
            Some(Some((FramePriority::Control, frame))) => out.push(decode_frame(&frame)),
            Some(Some((FramePriority::Data, _))) => {}
            Some(None) | None => break,
        }
    }
    out
}

fn encoded_data_message(message_id: u16, payload: &'static [u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    CbppEncoder
        .encode(
            CbppFrame::Data {
                message_id,
                payload: Bytes::from_static(payload),
            },
            &mut buf,
        )
        .expect("encode");
    buf.to_vec()
}

#[tokio::test(start_paused = true)]
async fn first_tick_sends_a_heartbeat_with_a_clock_reading() {
    let (client, mut queues) = new_client(Duration::from_millis(100));
    assert!(client.send(1, Bytes::from_static(b"hello")));

    tokio::time::sleep(Duration::from_millis(110)).await;

    let controls = drain_controls(&mut queues);
    assert_eq!(controls.len(), 1);
    let CbppEvent::Control {
        code, string_param, ..
    } = &controls[0]
    else {
        panic!("expected a control frame, got {:?}", controls[0]);
    };
    assert_eq!(*code, ControlCode::HEARTBEAT);
    assert!(
        string_param.parse::<u128>().is_ok(),
        "heartbeat carries a clock reading, got {string_param:?}"
    );
    assert!(!client.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn two_silent_periods_force_shutdown_after_one_ping() {
    let (client, mut queues) = new_client(Duration::from_millis(100));
    assert!(client.send(1, Bytes::from_static(b"hello")));

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(client.is_shutdown());
    let pings = drain_controls(&mut queues)
        .into_iter()
        .filter(|e| matches!(e, CbppEvent::Control { code, .. } if *code == ControlCode::HEARTBEAT))
        .count();
    assert_eq!(pings, 1, "the second tick shuts down instead of pinging");
}

#[tokio::test(start_paused = true)]
async fn inbound_data_messages_keep_the_connection_alive() {
    let (client, _queues) = new_client(Duration::from_millis(100));
    assert!(client.send(1, Bytes::from_static(b"hello")));

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(90)).await;
        client.put_encoded_data(&encoded_data_message(2, b"tick"));
        // Let the end-of-message job refresh the liveness clock.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(!client.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn no_timer_runs_before_the_first_send() {
    let (client, mut queues) = new_client(Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!client.is_shutdown());
    assert!(drain_controls(&mut queues).is_empty());
}
