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

use std::collections::HashMap;

use bytes::Bytes;

use crate::{AppError, AppResult};

/// Response status byte as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 20,
    /// the request was never flushed before the timeout fired
    ClientTimeout = 30,
    /// the request was sent but no reply arrived in time
    ServerTimeout = 31,
    /// the connection died with the call still in flight
    ChannelInactive = 35,
    /// request body failed to decode on the receiving side
    BadRequest = 40,
    /// response body failed to encode or exceeded the payload ceiling
    BadResponse = 50,
    ServiceNotFound = 60,
    ServiceError = 70,
    ServerError = 80,
    ClientError = 90,
    /// dispatch pool rejected the request
    ServerThreadPoolExhausted = 100,
}

impl Status {
    pub fn from_u8(value: u8) -> AppResult<Status> {
        match value {
            20 => Ok(Status::Ok),
            30 => Ok(Status::ClientTimeout),
            31 => Ok(Status::ServerTimeout),
            35 => Ok(Status::ChannelInactive),
            40 => Ok(Status::BadRequest),
            50 => Ok(Status::BadResponse),
            60 => Ok(Status::ServiceNotFound),
            70 => Ok(Status::ServiceError),
            80 => Ok(Status::ServerError),
            90 => Ok(Status::ClientError),
            100 => Ok(Status::ServerThreadPoolExhausted),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown response status byte {}",
                other
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Protocol control message carried by an event request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Heartbeat,
    /// peer is shutting down and will not take new two-way requests
    ReadOnly,
}

/// One invocation of a remote method. Arguments are opaque byte blobs
/// pre-serialized by the caller, the exchange layer never interprets them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcInvocation {
    pub service: String,
    pub method: String,
    pub parameter_desc: String,
    pub arguments: Vec<Bytes>,
    pub attachments: HashMap<String, String>,
}

impl RpcInvocation {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> RpcInvocation {
        RpcInvocation {
            service: service.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, argument: Bytes) -> RpcInvocation {
        self.arguments.push(argument);
        self
    }

    pub fn with_attachment(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> RpcInvocation {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a business invocation, either a value or a caught
/// exception, never both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcResult {
    pub value: Option<Bytes>,
    pub exception: Option<String>,
    pub attachments: HashMap<String, String>,
}

impl RpcResult {
    pub fn value(value: Bytes) -> RpcResult {
        RpcResult {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn exception(message: impl Into<String>) -> RpcResult {
        RpcResult {
            exception: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Invocation(RpcInvocation),
    Event(Event),
    /// the body failed to decode, carries the decode error text so the
    /// handler can answer with a bad-request response
    Broken(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub two_way: bool,
    pub event: bool,
    pub broken: bool,
    pub body: RequestBody,
}

impl Request {
    /// Two-way business request, expects a matching response.
    pub fn invocation(id: u64, invocation: RpcInvocation) -> Request {
        Request {
            id,
            two_way: true,
            event: false,
            broken: false,
            body: RequestBody::Invocation(invocation),
        }
    }

    /// One-way business request, fire and forget.
    pub fn one_way(id: u64, invocation: RpcInvocation) -> Request {
        Request {
            id,
            two_way: false,
            event: false,
            broken: false,
            body: RequestBody::Invocation(invocation),
        }
    }

    /// Two-way heartbeat event, the peer answers with a heartbeat
    /// response without touching business dispatch.
    pub fn heartbeat(id: u64) -> Request {
        Request {
            id,
            two_way: true,
            event: true,
            broken: false,
            body: RequestBody::Event(Event::Heartbeat),
        }
    }

    /// One-way readonly notice, broadcast before a graceful shutdown.
    pub fn readonly(id: u64) -> Request {
        Request {
            id,
            two_way: false,
            event: true,
            broken: false,
            body: RequestBody::Event(Event::ReadOnly),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event && matches!(self.body, RequestBody::Event(Event::Heartbeat))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    pub event: bool,
    pub error_message: Option<String>,
    pub result: Option<RpcResult>,
}

impl Response {
    pub fn ok(id: u64, result: RpcResult) -> Response {
        Response {
            id,
            status: Status::Ok,
            event: false,
            error_message: None,
            result: Some(result),
        }
    }

    pub fn heartbeat(id: u64) -> Response {
        Response {
            id,
            status: Status::Ok,
            event: true,
            error_message: None,
            result: None,
        }
    }

    pub fn error(id: u64, status: Status, message: impl Into<String>) -> Response {
        Response {
            id,
            status,
            event: false,
            error_message: Some(message.into()),
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn id(&self) -> u64 {
        match self {
            Message::Request(request) => request.id,
            Message::Response(response) => response.id,
        }
    }
}
