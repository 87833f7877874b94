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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error};

use crate::network::DynStream;
use crate::protocol::{ExchangeCodec, Message};
use crate::{AppError, AppResult, Shutdown};

/// Attribute key set by the handler when the peer announces it is
/// read-only ahead of a shutdown.
pub const READONLY_ATTR: &str = "channel.readonly";

/// Channel lifecycle. Client channels may fall back from `Connected` to
/// `Connecting` on a detected failure while they reconnect, server
/// channels go straight from `Connected` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Side-channel value kept in the per-channel attribute map. Every
/// component owns its own keys, heartbeat bookkeeping lives in the
/// typed timestamp fields instead.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    U64(u64),
    Str(String),
}

#[derive(Debug)]
pub(crate) enum WriteCommand {
    Message {
        message: Message,
        ack: Option<oneshot::Sender<AppResult<()>>>,
    },
    Close,
}

/// One live connection: addresses, state, activity timestamps, the
/// attribute map and the queue into the dedicated writer task.
#[derive(Debug)]
pub struct Channel {
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicCell<ChannelState>,
    last_read: AtomicCell<Instant>,
    last_write: AtomicCell<Instant>,
    attrs: DashMap<String, AttrValue>,
    outbound_tx: mpsc::Sender<WriteCommand>,
}

impl Channel {
    pub(crate) fn new(
        id: u64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        outbound_tx: mpsc::Sender<WriteCommand>,
    ) -> Channel {
        let now = Instant::now();
        Channel {
            id,
            local_addr,
            peer_addr,
            state: AtomicCell::new(ChannelState::New),
            last_read: AtomicCell::new(now),
            last_write: AtomicCell::new(now),
            attrs: DashMap::new(),
            outbound_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        self.state.load()
    }

    pub fn set_state(&self, state: ChannelState) {
        let old = self.state.swap(state);
        if old != state {
            debug!("channel {} {:?} -> {:?}", self.id, old, state);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load() == ChannelState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.load() == ChannelState::Closed
    }

    pub fn mark_read(&self) {
        self.last_read.store(Instant::now());
    }

    pub fn mark_write(&self) {
        self.last_write.store(Instant::now());
    }

    pub fn read_idle(&self) -> Duration {
        self.last_read.load().elapsed()
    }

    pub fn write_idle(&self) -> Duration {
        self.last_write.load().elapsed()
    }

    pub fn set_attr(&self, key: impl Into<String>, value: AttrValue) {
        self.attrs.insert(key.into(), value);
    }

    pub fn attr(&self, key: &str) -> Option<AttrValue> {
        self.attrs.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove_attr(&self, key: &str) -> Option<AttrValue> {
        self.attrs.remove(key).map(|(_, value)| value)
    }

    pub fn set_readonly(&self) {
        self.attrs
            .insert(READONLY_ATTR.to_string(), AttrValue::Bool(true));
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self.attr(READONLY_ATTR), Some(AttrValue::Bool(true)))
    }

    /// Queue a message to the writer task. With `wait_for_flush` the
    /// caller blocks up to `send_timeout` for the flush confirmation,
    /// otherwise the call returns as soon as the message is queued.
    pub async fn send(
        &self,
        message: Message,
        wait_for_flush: bool,
        send_timeout: Duration,
    ) -> AppResult<()> {
        if !wait_for_flush {
            return self.enqueue(message, None).await;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(message, Some(ack_tx)).await?;
        match time::timeout(send_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::ChannelInactive(format!(
                "writer task of channel {} is gone",
                self.id
            ))),
            Err(_) => Err(AppError::Transport(format!(
                "flush on channel {} not confirmed within {} ms",
                self.id,
                send_timeout.as_millis()
            ))),
        }
    }

    pub(crate) async fn enqueue(
        &self,
        message: Message,
        ack: Option<oneshot::Sender<AppResult<()>>>,
    ) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ChannelInactive(format!(
                "channel {} to {} is closed",
                self.id, self.peer_addr
            )));
        }
        self.outbound_tx
            .send(WriteCommand::Message { message, ack })
            .await
            .map_err(|_| {
                AppError::ChannelInactive(format!(
                    "channel {} to {} stopped writing",
                    self.id, self.peer_addr
                ))
            })
    }

    /// Terminal transition. The attribute map is cleared here, nothing
    /// may rely on it after close.
    pub(crate) fn close(&self) {
        self.set_state(ChannelState::Closed);
        self.attrs.clear();
        let _ = self.outbound_tx.try_send(WriteCommand::Close);
    }
}

/// Owns the write half: encodes queued messages, writes and flushes
/// them, stamps the last-write timestamp and reports flush outcomes to
/// waiting senders.
pub(crate) fn spawn_writer(
    channel: Arc<Channel>,
    mut writer: WriteHalf<DynStream>,
    codec: Arc<ExchangeCodec>,
    mut outbound_rx: mpsc::Receiver<WriteCommand>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    tokio::spawn(async move {
        let _shutdown_complete_tx = shutdown_complete_tx;
        let mut buf = BytesMut::with_capacity(4 * 1024);
        loop {
            let command = tokio::select! {
                command = outbound_rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            let (message, ack) = match command {
                WriteCommand::Close => break,
                WriteCommand::Message { message, ack } => (message, ack),
            };

            buf.clear();
            if let Err(e) = codec.encode(&message, &mut buf) {
                // an unencodable message fails its sender, not the
                // connection
                error!(
                    "failed to encode message {} on channel {}: {}",
                    message.id(),
                    channel.id(),
                    e
                );
                if let Some(ack) = ack {
                    let _ = ack.send(Err(e));
                }
                continue;
            }

            let flushed = async {
                writer.write_all(&buf).await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;

            match flushed {
                Ok(()) => {
                    channel.mark_write();
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    error!("write on channel {} failed: {}", channel.id(), e);
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(AppError::Transport(format!(
                            "write on channel {} failed: {}",
                            channel.id(),
                            e
                        ))));
                    }
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
        debug!("writer task of channel {} exited", channel.id());
    });
}
