use bytes::{Bytes, BytesMut};
use rstest::rstest;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    CbppDecoder,
    CbppEncoder,
    CbppEvent,
    CbppFrame,
    CodecError,
    ControlCode,
    StatusCode,
};

fn drain(decoder: &mut CbppDecoder, src: &mut BytesMut) -> Vec<CbppEvent> {
    let mut events = Vec::new();
    while let Some(event) = decoder.decode(src).expect("well-formed stream") {
        events.push(event);
    }
    events
}

#[test]
fn small_data_message_decodes_to_header_payload_end() {
    let mut src = BytesMut::from(&[0x01, 0x00, 0x03, 0x41, 0x42, 0x43][..]);
    let events = drain(&mut CbppDecoder::new(), &mut src);

    assert_eq!(
        events.first(),
        Some(&CbppEvent::DataHeader {
            message_id: 1,
            payload_size: 3
        })
    );
    assert_eq!(events.last(), Some(&CbppEvent::DataEnd { payload_size: 3 }));
    let payload: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            CbppEvent::DataPayload { chunk, .. } => Some(chunk.as_ref()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    assert_eq!(payload, b"ABC");
}

#[test]
fn escaped_length_decodes_256_byte_payload() {
    let mut src = BytesMut::from(&[0x01, 0x00, 0xFE, 0x00, 0x01][..]);
    src.extend_from_slice(&[0xAAu8; 256]);
    let events = drain(&mut CbppDecoder::new(), &mut src);

    assert_eq!(
        events.first(),
        Some(&CbppEvent::DataHeader {
            message_id: 1,
            payload_size: 256
        })
    );
    let total: usize = events
        .iter()
        .filter_map(|e| match e {
            CbppEvent::DataPayload { chunk, .. } => Some(chunk.len()),
            _ => None,
        })
        .sum();
    assert_eq!(total, 256);
    assert_eq!(
        events.last(),
        Some(&CbppEvent::DataEnd { payload_size: 256 })
    );
}

#[test]
fn zero_length_payload_emits_header_and_end_only() {
    let mut src = BytesMut::from(&[0x07, 0x00, 0x00][..]);
    let events = drain(&mut CbppDecoder::new(), &mut src);
    assert_eq!(
        events,
        vec![
            CbppEvent::DataHeader {
                message_id: 7,
                payload_size: 0
            },
            CbppEvent::DataEnd { payload_size: 0 },
        ]
    );
}

#[test]
fn dribbled_bytes_produce_contiguous_slices() {
    let mut encoded = BytesMut::new();
    let payload = Bytes::from(vec![0x5Au8; 300]);
    CbppEncoder
        .encode(
            CbppFrame::Data {
                message_id: 9,
                payload: payload.clone(),
            },
            &mut encoded,
        )
        .expect("encode");

    let mut decoder = CbppDecoder::new();
    let mut src = BytesMut::new();
    let mut events = Vec::new();
    for byte in &encoded {
        src.extend_from_slice(&[*byte]);
        events.extend(drain(&mut decoder, &mut src));
    }

    let mut expected_offset = 0u64;
    let mut reassembled = Vec::new();
    for event in &events {
        if let CbppEvent::DataPayload { offset, chunk } = event {
            assert_eq!(*offset, expected_offset, "slices must be contiguous");
            expected_offset += chunk.len() as u64;
            reassembled.extend_from_slice(chunk);
        }
    }
    assert_eq!(reassembled, payload.as_ref());
    assert_eq!(
        events.last(),
        Some(&CbppEvent::DataEnd { payload_size: 300 })
    );
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(0xFD)]
#[case(0xFE)]
#[case(0xFFFF)]
#[case(0x10000)]
fn writer_reader_round_trip(#[case] payload_size: usize) {
    let payload = Bytes::from(vec![0x42u8; payload_size]);
    let mut encoded = BytesMut::new();
    CbppEncoder
        .encode(
            CbppFrame::Data {
                message_id: 42,
                payload: payload.clone(),
            },
            &mut encoded,
        )
        .expect("encode");

    let events = drain(&mut CbppDecoder::new(), &mut encoded);
    let headers = events
        .iter()
        .filter(|e| matches!(e, CbppEvent::DataHeader { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|e| matches!(e, CbppEvent::DataEnd { .. }))
        .count();
    assert_eq!((headers, ends), (1, 1));
    assert_eq!(
        events.first(),
        Some(&CbppEvent::DataHeader {
            message_id: 42,
            payload_size: payload_size as u64
        })
    );
}

#[test]
fn control_frame_round_trips() {
    let mut encoded = BytesMut::new();
    CbppEncoder
        .encode(
            CbppFrame::Control {
                code: ControlCode(5),
                vint_param: -12345,
                string_param: "deadline exceeded".to_owned(),
            },
            &mut encoded,
        )
        .expect("encode");

    let events = drain(&mut CbppDecoder::new(), &mut encoded);
    assert_eq!(
        events,
        vec![CbppEvent::Control {
            code: ControlCode(5),
            vint_param: -12345,
            string_param: "deadline exceeded".to_owned(),
        }]
    );
}

#[test]
fn heartbeat_is_control_code_zero() {
    let mut encoded = BytesMut::new();
    CbppEncoder
        .encode(
            CbppFrame::Control {
                code: ControlCode::HEARTBEAT,
                vint_param: 0,
                string_param: String::new(),
            },
            &mut encoded,
        )
        .expect("encode");
    // id 0, payload size 3, zig-zag zeros, empty string.
    assert_eq!(encoded.as_ref(), &[0x00, 0x00, 0x03, 0x00, 0x00, 0x00]);
}

#[test]
fn error_reply_carries_message_id_and_status() {
    let frame = CbppFrame::error_reply(17, StatusCode::InternalError, "boom");
    let CbppFrame::Control {
        code, vint_param, ..
    } = frame
    else {
        panic!("error reply must be a control frame");
    };
    assert_eq!(code, ControlCode(17));
    assert_eq!(vint_param, StatusCode::InternalError.as_i64());
}

#[test]
fn oversize_payload_is_rejected_before_buffering() {
    let mut src = BytesMut::from(&[0x01, 0x00, 0xFF][..]);
    src.extend_from_slice(&u64::MAX.to_le_bytes());

    let mut decoder = CbppDecoder::new().with_max_payload_size(1024);
    let err = decoder.decode(&mut src).expect_err("must reject");
    match err {
        CodecError::Protocol(v) => assert_eq!(v.status, StatusCode::RequestTooLarge),
        CodecError::Io(e) => panic!("unexpected I/O error: {e}"),
    }
}

#[test]
fn control_string_length_mismatch_is_rejected() {
    // Control payload claims a 9-byte string but carries 2 bytes.
    let mut src = BytesMut::from(&[0x00, 0x00, 0x05, 0x00, 0x00, 0x09, b'h', b'i'][..]);
    let err = CbppDecoder::new()
        .decode(&mut src)
        .expect_err("must reject");
    match err {
        CodecError::Protocol(v) => assert_eq!(v.status, StatusCode::LengthOverflow),
        CodecError::Io(e) => panic!("unexpected I/O error: {e}"),
    }
}

#[test]
fn data_message_id_zero_is_unencodable() {
    let err = CbppEncoder
        .encode(
            CbppFrame::Data {
                message_id: 0,
                payload: Bytes::new(),
            },
            &mut BytesMut::new(),
        )
        .expect_err("id 0 is reserved");
    assert!(matches!(err, CodecError::Protocol(_)));
}

#[test]
fn current_message_id_tracks_last_header() {
    let mut decoder = CbppDecoder::new();
    let mut src = BytesMut::from(&[0x2A, 0x00, 0x00][..]);
    drain(&mut decoder, &mut src);
    assert_eq!(decoder.current_message_id(), 0x2A);
}
