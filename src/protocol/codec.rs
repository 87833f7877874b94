// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::error;

use crate::protocol::serialization::{Serialization, SerializationRegistry};
use crate::protocol::{Event, Message, Request, RequestBody, Response, Status};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult, ProtocolConfig};

pub const HEADER_LENGTH: usize = 16;
pub const MAGIC: [u8; 2] = [0xda, 0xbb];

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;

const READONLY_EVENT_TOKEN: &[u8] = b"R";

/// One unit pulled out of the inbound buffer: either a protocol frame
/// or a span of bytes that could not be resynchronized to a frame and
/// falls through to the text-command path.
#[derive(Debug)]
pub enum DecodedFrame {
    Message(Message),
    Text(String),
}

enum FrameCheck {
    /// a full frame is buffered
    Frame,
    /// this many leading bytes are not protocol input
    Text { span: usize },
}

/// Encodes and decodes exchange frames. The 16-byte header is fixed:
/// 2-byte magic, 1 flag byte `[request|two-way|event|5-bit serialization
/// id]`, 1 status byte (responses only), 8-byte big-endian request id,
/// 4-byte big-endian body length.
#[derive(Debug)]
pub struct ExchangeCodec {
    serialization: Arc<dyn Serialization>,
    registry: Arc<SerializationRegistry>,
    max_payload_size: usize,
}

impl ExchangeCodec {
    pub fn new(config: &ProtocolConfig, registry: Arc<SerializationRegistry>) -> AppResult<Self> {
        let serialization = registry.by_name(&config.serialization)?;
        Ok(ExchangeCodec {
            serialization,
            registry,
            max_payload_size: config.max_payload_size,
        })
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encodes a message into `buf`. An oversized or unencodable
    /// response degrades to a bad-response frame carrying the error
    /// text so the peer is never left waiting, an oversized request
    /// fails to the caller.
    pub fn encode(&self, message: &Message, buf: &mut BytesMut) -> AppResult<()> {
        match message {
            Message::Request(request) => self.encode_request(request, buf),
            Message::Response(response) => match self.encode_response(response, buf) {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(
                        "failed to encode response for call {}, degrading to bad response: {}",
                        response.id, e
                    );
                    // the fallback text must itself fit under the ceiling
                    let mut message = e.to_string();
                    let limit = self.max_payload_size.min(256);
                    if message.len() > limit {
                        let mut end = limit;
                        while !message.is_char_boundary(end) {
                            end -= 1;
                        }
                        message.truncate(end);
                    }
                    let bad = Response::error(response.id, Status::BadResponse, message);
                    self.encode_response(&bad, buf)
                }
            },
        }
    }

    pub fn encode_request(&self, request: &Request, buf: &mut BytesMut) -> AppResult<()> {
        let mut flag = FLAG_REQUEST | self.serialization.content_type_id();
        if request.two_way {
            flag |= FLAG_TWO_WAY;
        }
        if request.event {
            flag |= FLAG_EVENT;
        }

        let frame_start = buf.len();
        self.put_header(buf, flag, 0, request.id);
        let body_start = buf.len();
        let encoded = match &request.body {
            RequestBody::Invocation(invocation) => {
                self.serialization.encode_invocation(invocation, buf)
            }
            RequestBody::Event(event) => {
                encode_event(*event, buf);
                Ok(())
            }
            RequestBody::Broken(message) => Err(AppError::InvalidValue(format!(
                "broken request {} can not be sent: {}",
                request.id, message
            ))),
        };
        self.seal_frame(buf, frame_start, body_start, encoded)
    }

    pub fn encode_response(&self, response: &Response, buf: &mut BytesMut) -> AppResult<()> {
        let mut flag = self.serialization.content_type_id();
        if response.event {
            flag |= FLAG_EVENT;
        }

        let frame_start = buf.len();
        self.put_header(buf, flag, response.status.as_u8(), response.id);
        let body_start = buf.len();
        let encoded = if response.event {
            Ok(())
        } else if response.status.is_ok() {
            let result = response.result.clone().unwrap_or_default();
            self.serialization.encode_result(&result, buf)
        } else {
            buf.put_slice(response.error_message.as_deref().unwrap_or("").as_bytes());
            Ok(())
        };
        self.seal_frame(buf, frame_start, body_start, encoded)
    }

    fn put_header(&self, buf: &mut BytesMut, flag: u8, status: u8, id: u64) {
        buf.reserve(HEADER_LENGTH);
        buf.put_slice(&MAGIC);
        buf.put_u8(flag);
        buf.put_u8(status);
        buf.put_u64(id);
        // length backfilled once the body is encoded
        buf.put_u32(0);
    }

    /// Backfills the length field, or rolls the partial frame back out
    /// of the buffer when body encoding failed or blew the ceiling.
    fn seal_frame(
        &self,
        buf: &mut BytesMut,
        frame_start: usize,
        body_start: usize,
        encoded: AppResult<()>,
    ) -> AppResult<()> {
        if let Err(e) = encoded {
            buf.truncate(frame_start);
            return Err(e);
        }
        let body_len = buf.len() - body_start;
        if body_len > self.max_payload_size {
            buf.truncate(frame_start);
            return Err(AppError::PayloadTooLarge {
                length: body_len,
                limit: self.max_payload_size,
            });
        }
        buf[body_start - 4..body_start].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(())
    }

    /// Pulls the next frame out of `buffer`. `Ok(None)` means not
    /// enough bytes are buffered yet and nothing was consumed, the call
    /// is safe to repeat on the same buffer once more bytes arrive.
    /// Repeated calls drain a run of fully-buffered frames in arrival
    /// order.
    pub fn decode(&self, buffer: &mut BytesMut) -> AppResult<Option<DecodedFrame>> {
        match self.check(buffer) {
            Ok(FrameCheck::Text { span }) => {
                let raw = buffer.split_to(span);
                Ok(Some(DecodedFrame::Text(
                    String::from_utf8_lossy(&raw).to_string(),
                )))
            }
            Ok(FrameCheck::Frame) => {
                let mut header = buffer.split_to(HEADER_LENGTH);
                header.advance(MAGIC.len());
                let flag = header.get_u8();
                let status_byte = header.get_u8();
                let id = header.get_u64();
                let body_len = header.get_u32() as usize;
                let mut body = buffer.split_to(body_len);

                let serialization_id = flag & SERIALIZATION_MASK;
                let message = if flag & FLAG_REQUEST != 0 {
                    Message::Request(self.decode_request(flag, id, serialization_id, &mut body))
                } else {
                    Message::Response(self.decode_response(
                        flag,
                        status_byte,
                        id,
                        serialization_id,
                        &mut body,
                    ))
                };
                Ok(Some(DecodedFrame::Message(message)))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn check(&self, buffer: &BytesMut) -> AppResult<FrameCheck> {
        let len = buffer.len();
        if len == 0 {
            return Err(Incomplete);
        }
        if buffer[0] != MAGIC[0] {
            return self.resync(buffer);
        }
        if len == 1 {
            // a lone magic-high byte, the pair may straddle a read boundary
            return Err(Incomplete);
        }
        if buffer[1] != MAGIC[1] {
            return self.resync(buffer);
        }
        if len < HEADER_LENGTH {
            return Err(Incomplete);
        }
        let body_len =
            u32::from_be_bytes(buffer[12..HEADER_LENGTH].try_into().unwrap()) as usize;
        if body_len > self.max_payload_size {
            // reject on the declared length, never buffer the body
            return Err(AppError::PayloadTooLarge {
                length: body_len,
                limit: self.max_payload_size,
            });
        }
        if len < HEADER_LENGTH + body_len {
            return Err(Incomplete);
        }
        Ok(FrameCheck::Frame)
    }

    /// The buffer does not start with the magic pair: scan forward for
    /// the next occurrence and hand everything before it to the text
    /// fallback. A trailing magic-high byte is held back in case its
    /// partner arrives with the next read.
    fn resync(&self, buffer: &BytesMut) -> AppResult<FrameCheck> {
        let len = buffer.len();
        for i in 1..len.saturating_sub(1) {
            if buffer[i] == MAGIC[0] && buffer[i + 1] == MAGIC[1] {
                return Ok(FrameCheck::Text { span: i });
            }
        }
        if buffer[len - 1] == MAGIC[0] {
            if len == 1 {
                return Err(Incomplete);
            }
            return Ok(FrameCheck::Text { span: len - 1 });
        }
        Ok(FrameCheck::Text { span: len })
    }

    fn decode_request(
        &self,
        flag: u8,
        id: u64,
        serialization_id: u8,
        body: &mut BytesMut,
    ) -> Request {
        let two_way = flag & FLAG_TWO_WAY != 0;
        let event = flag & FLAG_EVENT != 0;
        let decoded = if event {
            decode_event(body).map(RequestBody::Event)
        } else {
            self.registry
                .by_id(serialization_id)
                .and_then(|serialization| serialization.decode_invocation(body))
                .map(RequestBody::Invocation)
        };
        // a malformed body must not abort the frame, the handler layer
        // answers with a bad-request response instead
        match decoded {
            Ok(request_body) => Request {
                id,
                two_way,
                event,
                broken: false,
                body: request_body,
            },
            Err(e) => Request {
                id,
                two_way,
                event,
                broken: true,
                body: RequestBody::Broken(e.to_string()),
            },
        }
    }

    fn decode_response(
        &self,
        flag: u8,
        status_byte: u8,
        id: u64,
        serialization_id: u8,
        body: &mut BytesMut,
    ) -> Response {
        let event = flag & FLAG_EVENT != 0;
        let decoded = Status::from_u8(status_byte).and_then(|status| {
            if event {
                return Ok(Response::heartbeat(id));
            }
            if !status.is_ok() {
                let message = String::from_utf8_lossy(body).to_string();
                return Ok(Response::error(id, status, message));
            }
            let result = self
                .registry
                .by_id(serialization_id)
                .and_then(|serialization| serialization.decode_result(body))?;
            Ok(Response::ok(id, result))
        });
        // the caller is still waiting on this id, degrade instead of
        // dropping the frame
        decoded.unwrap_or_else(|e| {
            Response::error(
                id,
                Status::ClientError,
                format!("failed to decode response body: {}", e),
            )
        })
    }
}

fn encode_event(event: Event, buf: &mut BytesMut) {
    match event {
        // heartbeats travel with an empty payload
        Event::Heartbeat => {}
        Event::ReadOnly => buf.put_slice(READONLY_EVENT_TOKEN),
    }
}

fn decode_event(body: &mut BytesMut) -> AppResult<Event> {
    if body.is_empty() {
        return Ok(Event::Heartbeat);
    }
    if body.as_ref() == READONLY_EVENT_TOKEN {
        return Ok(Event::ReadOnly);
    }
    Err(AppError::MalformedProtocol(format!(
        "unrecognized event token of {} bytes",
        body.len()
    )))
}
