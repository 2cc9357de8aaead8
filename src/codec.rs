//! Streaming codec for the CBPP wire protocol.
//!
//! A CBPP stream carries two multiplexed channels over one connection:
//! data messages (`[u16 message_id][varuint payload_size][payload]`, ids
//! 1..=65535) and control messages (the reserved id 0, whose payload is
//! `[varint control_code][varint vint_param][varuint strlen][string]`).
//!
//! The decoder is event-oriented rather than frame-oriented: a data message
//! is surfaced as a header event, zero or more payload-slice events with
//! strictly increasing contiguous offsets, and an end event, so that
//! arbitrarily large payloads never have to be buffered in one piece.
//! Control messages are small and bounded, and are decoded whole.
//!
//! # Error Handling
//!
//! Structural violations are reported synchronously as
//! [`ProtocolViolation`] values carrying a [`StatusCode`]; the session and
//! client layers decide shutdown policy. See the [`error`] module.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    outbound::FrameHandle,
    varint::{get_varint, get_varuint, put_varint, put_varuint, varuint_len},
};

pub mod error;

pub use error::{CodecError, ProtocolViolation, StatusCode};

/// Message id reserved for the control channel.
pub const CONTROL_MESSAGE_ID: u16 = 0;

/// Width of the fixed part of a frame header (`u16` message id).
const MESSAGE_ID_SIZE: usize = 2;

/// Default acceptance bound for a control-message payload.
///
/// Control messages carry a code, a varint parameter, and a short string;
/// anything larger is hostile.
pub const DEFAULT_MAX_CONTROL_PAYLOAD: usize = 4096;

/// Code carried by a control message.
///
/// Only [`ControlCode::HEARTBEAT`] is defined by the core; error replies
/// reuse the field to carry the offending message id, and anything else is
/// unknown by definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ControlCode(pub i64);

impl ControlCode {
    /// Liveness probe; also the client keep-alive ping.
    pub const HEARTBEAT: Self = Self(0);
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event produced by [`CbppDecoder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CbppEvent {
    /// A data-message header was parsed.
    DataHeader {
        /// Message id (never 0).
        message_id: u16,
        /// Total payload size announced by the header.
        payload_size: u64,
    },
    /// A contiguous run of payload bytes.
    DataPayload {
        /// Offset of `chunk` within the payload; slices are contiguous
        /// from 0 to `payload_size`.
        offset: u64,
        /// The bytes.
        chunk: Bytes,
    },
    /// The data message is complete.
    DataEnd {
        /// Total payload size, equal to the header's announcement.
        payload_size: u64,
    },
    /// A complete control message.
    Control {
        /// Control code.
        code: ControlCode,
        /// Varint parameter.
        vint_param: i64,
        /// String parameter (UTF-8).
        string_param: String,
    },
}

#[derive(Clone, Copy)]
enum DecodeState {
    Header,
    Payload { payload_size: u64, offset: u64 },
    Control { payload_size: usize },
}

/// Streaming decoder for CBPP frames.
///
/// Implements [`Decoder`] so it composes with `tokio_util`'s `Framed`
/// machinery; sessions and clients feed it directly from their receive
/// buffers.
pub struct CbppDecoder {
    state: DecodeState,
    max_payload_size: u64,
    max_control_payload: usize,
    message_id: u16,
}

impl Default for CbppDecoder {
    fn default() -> Self { Self::new() }
}

impl CbppDecoder {
    /// Construct a decoder with no data-payload bound.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            max_payload_size: u64::MAX,
            max_control_payload: DEFAULT_MAX_CONTROL_PAYLOAD,
            message_id: 0,
        }
    }

    /// Reject data payloads larger than `bound` bytes.
    #[must_use]
    pub fn with_max_payload_size(mut self, bound: u64) -> Self {
        self.max_payload_size = bound;
        self
    }

    /// Message id of the frame currently being decoded.
    ///
    /// Used by the error path to attribute a violation to the message that
    /// triggered it; 0 until the first header has been parsed.
    #[must_use]
    pub fn current_message_id(&self) -> u16 { self.message_id }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<CbppEvent>, CodecError> {
        let Some((payload_size, varuint_consumed)) =
            src.get(MESSAGE_ID_SIZE..).and_then(get_varuint)
        else {
            return Ok(None);
        };
        let message_id = u16::from_le_bytes([src[0], src[1]]);
        src.advance(MESSAGE_ID_SIZE + varuint_consumed);
        self.message_id = message_id;

        if message_id == CONTROL_MESSAGE_ID {
            if payload_size > self.max_control_payload as u64 {
                return Err(ProtocolViolation::new(
                    StatusCode::BadMessage,
                    format!("control payload of {payload_size} bytes exceeds bound"),
                )
                .into());
            }
            self.state = DecodeState::Control {
                payload_size: payload_size as usize,
            };
            // Surface a fully buffered control frame from the same call.
            return self.decode_control(src);
        }

        if payload_size > self.max_payload_size {
            return Err(ProtocolViolation::new(
                StatusCode::RequestTooLarge,
                format!(
                    "payload of {payload_size} bytes exceeds bound of {}",
                    self.max_payload_size
                ),
            )
            .into());
        }
        self.state = DecodeState::Payload {
            payload_size,
            offset: 0,
        };
        Ok(Some(CbppEvent::DataHeader {
            message_id,
            payload_size,
        }))
    }

    fn decode_payload(
        &mut self,
        payload_size: u64,
        offset: u64,
        src: &mut BytesMut,
    ) -> Option<CbppEvent> {
        if offset == payload_size {
            self.state = DecodeState::Header;
            return Some(CbppEvent::DataEnd { payload_size });
        }
        if src.is_empty() {
            return None;
        }
        let remaining = payload_size - offset;
        let take = (src.len() as u64).min(remaining) as usize;
        let chunk = src.split_to(take).freeze();
        self.state = DecodeState::Payload {
            payload_size,
            offset: offset + take as u64,
        };
        Some(CbppEvent::DataPayload { offset, chunk })
    }

    fn decode_control(&mut self, src: &mut BytesMut) -> Result<Option<CbppEvent>, CodecError> {
        let DecodeState::Control { payload_size } = self.state else {
            unreachable!("decode_control outside control state");
        };
        if src.len() < payload_size {
            return Ok(None);
        }
        let payload = src.split_to(payload_size);
        self.state = DecodeState::Header;
        Ok(Some(parse_control_payload(&payload)?))
    }
}

fn parse_control_payload(payload: &[u8]) -> Result<CbppEvent, ProtocolViolation> {
    let bad = |reason: &str| ProtocolViolation::new(StatusCode::BadMessage, reason.to_owned());

    let (code, consumed) = get_varint(payload).ok_or_else(|| bad("truncated control code"))?;
    let rest = &payload[consumed..];
    let (vint_param, consumed) = get_varint(rest).ok_or_else(|| bad("truncated vint param"))?;
    let rest = &rest[consumed..];
    let (strlen, consumed) =
        get_varuint(rest).ok_or_else(|| bad("truncated string param length"))?;
    let rest = &rest[consumed..];

    if strlen != rest.len() as u64 {
        return Err(ProtocolViolation::new(
            StatusCode::LengthOverflow,
            format!(
                "control string length {strlen} disagrees with {} remaining bytes",
                rest.len()
            ),
        ));
    }
    let string_param = std::str::from_utf8(rest)
        .map_err(|_| bad("control string param is not valid UTF-8"))?
        .to_owned();

    Ok(CbppEvent::Control {
        code: ControlCode(code),
        vint_param,
        string_param,
    })
}

impl Decoder for CbppDecoder {
    type Item = CbppEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Header => self.decode_header(src),
            DecodeState::Payload {
                payload_size,
                offset,
            } => Ok(self.decode_payload(payload_size, offset, src)),
            DecodeState::Control { .. } => self.decode_control(src),
        }
    }
}

/// A complete outbound CBPP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CbppFrame {
    /// Data message on ids 1..=65535.
    Data {
        /// Message id; 0 is reserved and rejected by the encoder.
        message_id: u16,
        /// Payload bytes.
        payload: Bytes,
    },
    /// Control message on the reserved id 0.
    Control {
        /// Control code.
        code: ControlCode,
        /// Varint parameter.
        vint_param: i64,
        /// String parameter.
        string_param: String,
    },
}

impl CbppFrame {
    /// The control frame a peer sends to report `status` for `message_id`
    /// before shutting the connection down.
    #[must_use]
    pub fn error_reply(message_id: u16, status: StatusCode, reason: &str) -> Self {
        Self::Control {
            code: ControlCode(i64::from(message_id)),
            vint_param: status.as_i64(),
            string_param: reason.to_owned(),
        }
    }
}

/// Encoder for [`CbppFrame`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CbppEncoder;

impl Encoder<CbppFrame> for CbppEncoder {
    type Error = CodecError;

    fn encode(&mut self, item: CbppFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            CbppFrame::Data {
                message_id,
                payload,
            } => {
                if message_id == CONTROL_MESSAGE_ID {
                    return Err(ProtocolViolation::new(
                        StatusCode::BadMessage,
                        "message id 0 is reserved for the control channel",
                    )
                    .into());
                }
                dst.reserve(MESSAGE_ID_SIZE + varuint_len(payload.len() as u64) + payload.len());
                dst.put_u16_le(message_id);
                put_varuint(dst, payload.len() as u64);
                dst.extend_from_slice(&payload);
            }
            CbppFrame::Control {
                code,
                vint_param,
                string_param,
            } => {
                let mut body = BytesMut::with_capacity(
                    varuint_len(string_param.len() as u64) + string_param.len() + 18,
                );
                put_varint(&mut body, code.0);
                put_varint(&mut body, vint_param);
                put_varuint(&mut body, string_param.len() as u64);
                body.extend_from_slice(string_param.as_bytes());

                dst.reserve(MESSAGE_ID_SIZE + varuint_len(body.len() as u64) + body.len());
                dst.put_u16_le(CONTROL_MESSAGE_ID);
                put_varuint(dst, body.len() as u64);
                dst.extend_from_slice(&body);
            }
        }
        Ok(())
    }
}

/// Outbound half of a CBPP connection.
///
/// Encodes frames and pushes them to the connection's prioritized outbound
/// queues: control frames on the urgent channel, data frames behind them.
/// The boolean results report whether the sink accepted the bytes;
/// fragmentation across the wire is the transport's concern.
pub struct CbppWriter {
    handle: FrameHandle,
}

impl CbppWriter {
    /// Wrap an outbound queue handle.
    #[must_use]
    pub fn new(handle: FrameHandle) -> Self { Self { handle } }

    /// Encode and queue a data message.
    pub fn put_data_message(&self, message_id: u16, payload: Bytes) -> bool {
        self.put(CbppFrame::Data {
            message_id,
            payload,
        })
    }

    /// Encode and queue a control message.
    pub fn put_control_message(
        &self,
        code: ControlCode,
        vint_param: i64,
        string_param: &str,
    ) -> bool {
        self.put(CbppFrame::Control {
            code,
            vint_param,
            string_param: string_param.to_owned(),
        })
    }

    fn put(&self, frame: CbppFrame) -> bool {
        let control = matches!(frame, CbppFrame::Control { .. });
        let mut buf = BytesMut::new();
        if let Err(e) = CbppEncoder.encode(frame, &mut buf) {
            log::warn!("dropping unencodable frame: {e}");
            return false;
        }
        let bytes = buf.freeze();
        if control {
            self.handle.try_send_control(bytes).is_ok()
        } else {
            self.handle.try_send_data(bytes).is_ok()
        }
    }
}

#[cfg(test)]
mod tests;
