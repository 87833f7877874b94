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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
#[error("exchange error")]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, a frame is not fully buffered yet
    Incomplete,

    /// exchange protocol errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{message}")]
    Timeout {
        message: String,
        /// whether the request had been flushed to the wire before the
        /// timeout fired, distinguishes a client-side send timeout from
        /// a server-side response timeout
        sent: bool,
        elapsed_ms: u64,
    },

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("frame body of {length} bytes exceeds payload limit of {limit} bytes")]
    PayloadTooLarge { length: usize, limit: usize },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("server overloaded: {0}")]
    Overloaded(String),

    #[error("channel inactive: {0}")]
    ChannelInactive(String),
}
