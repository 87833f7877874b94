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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info};

use crate::exchange::{Correlator, ExchangeHandler, ResponseFuture};
use crate::network::{spawn_writer, Channel, ChannelState, Connected, Connection};
use crate::protocol::{ExchangeCodec, Message, Request, RpcInvocation};
use crate::{AppError, AppResult, Shutdown};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection façade of the exchange layer: `request` for two-way
/// calls correlated by id, `send` for everything else. Wraps the
/// network channel and shares the role's correlator.
#[derive(Debug)]
pub struct ExchangeChannel {
    channel: Arc<Channel>,
    correlator: Arc<Correlator>,
    send_timeout: Duration,
}

impl ExchangeChannel {
    pub(crate) fn new(
        channel: Arc<Channel>,
        correlator: Arc<Correlator>,
        send_timeout: Duration,
    ) -> ExchangeChannel {
        ExchangeChannel {
            channel,
            correlator,
            send_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Writes a message through the underlying transport. With
    /// `wait_for_flush` the call blocks up to the configured send
    /// timeout for the flush confirmation.
    pub async fn send(&self, message: Message, wait_for_flush: bool) -> AppResult<()> {
        self.channel
            .send(message, wait_for_flush, self.send_timeout)
            .await
    }

    /// Wraps `invocation` as a two-way request, registers it with the
    /// correlator and queues the send. Returns the future immediately,
    /// the I/O path never blocks on the caller.
    pub async fn request(
        &self,
        invocation: RpcInvocation,
        timeout: Duration,
    ) -> AppResult<ResponseFuture> {
        match self.channel.state() {
            ChannelState::Closing | ChannelState::Closed => {
                return Err(AppError::ChannelInactive(format!(
                    "channel {} is {:?}, refusing new request",
                    self.channel.id(),
                    self.channel.state()
                )))
            }
            _ => {}
        }
        if self.channel.is_readonly() {
            return Err(AppError::ChannelInactive(format!(
                "peer of channel {} is read-only, refusing new request",
                self.channel.id()
            )));
        }

        let id = self.correlator.next_request_id();
        let request = Request::invocation(id, invocation);
        let future = self
            .correlator
            .register(self.channel.id(), &request, timeout)
            .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if let Err(e) = self
            .channel
            .enqueue(Message::Request(request), Some(ack_tx))
            .await
        {
            self.correlator.cancel(id);
            return Err(e);
        }

        // the flush outcome arrives later, feed it to the correlator
        // without holding up this caller
        let correlator = self.correlator.clone();
        tokio::spawn(async move {
            match ack_rx.await {
                Ok(Ok(())) => correlator.mark_sent(id),
                Ok(Err(e)) => correlator.fail(id, e),
                // writer dropped the ack, the channel-close path fails
                // the call
                Err(_) => {}
            }
        });

        Ok(future)
    }

    /// One-way business request, no reply is ever delivered.
    pub async fn send_one_way(
        &self,
        invocation: RpcInvocation,
        wait_for_flush: bool,
    ) -> AppResult<()> {
        let request = Request::one_way(self.correlator.next_request_id(), invocation);
        self.send(Message::Request(request), wait_for_flush).await
    }

    pub(crate) async fn send_heartbeat(&self) -> AppResult<()> {
        let request = Request::heartbeat(self.correlator.next_request_id());
        self.send(Message::Request(request), false).await
    }

    pub(crate) async fn send_readonly_event(&self) -> AppResult<()> {
        let request = Request::readonly(self.correlator.next_request_id());
        self.send(Message::Request(request), false).await
    }

    /// Graceful close: stop accepting new two-way requests, wait for
    /// the channel's pending calls to drain up to `timeout`, then force
    /// close.
    pub async fn close(&self, timeout: Duration) {
        if self.channel.is_closed() {
            return;
        }
        self.channel.set_state(ChannelState::Closing);
        let deadline = time::Instant::now() + timeout;
        while self.correlator.pending_on_channel(self.channel.id()) > 0
            && time::Instant::now() < deadline
        {
            time::sleep(Duration::from_millis(10)).await;
        }
        self.force_close();
    }

    /// Immediate close: the channel stops, every call still pending on
    /// it fails with a channel-inactive error.
    pub fn force_close(&self) {
        if self.channel.is_closed() {
            return;
        }
        self.channel.close();
        self.correlator.on_channel_closed(self.channel.id());
    }
}

/// Builds the full per-connection assembly: network channel, writer
/// task, exchange façade and reader task. `on_close` runs once the
/// reader exits, after the channel is force-closed.
pub(crate) fn open_channel(
    connected: Connected,
    codec: &Arc<ExchangeCodec>,
    correlator: &Arc<Correlator>,
    handler: &Arc<ExchangeHandler>,
    outbound_queue_size: usize,
    read_buffer_size: usize,
    send_timeout: Duration,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    on_close: impl FnOnce(u64) + Send + 'static,
) -> Arc<ExchangeChannel> {
    let Connected {
        stream,
        local_addr,
        peer_addr,
    } = connected;
    let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue_size);

    let channel = Arc::new(Channel::new(id, local_addr, peer_addr, outbound_tx));
    channel.set_state(ChannelState::Connecting);
    spawn_writer(
        channel.clone(),
        write_half,
        codec.clone(),
        outbound_rx,
        notify_shutdown.clone(),
        shutdown_complete_tx.clone(),
    );

    let exchange = Arc::new(ExchangeChannel::new(
        channel.clone(),
        correlator.clone(),
        send_timeout,
    ));
    channel.set_state(ChannelState::Connected);
    info!("channel {} open: {} <-> {}", id, local_addr, peer_addr);

    let reader_channel = exchange.clone();
    let reader_codec = codec.clone();
    let reader_handler = handler.clone();
    tokio::spawn(async move {
        let _shutdown_complete_tx = shutdown_complete_tx;
        let mut connection = Connection::new(read_half, reader_codec, read_buffer_size);
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        loop {
            let read = tokio::select! {
                res = connection.read_frame() => res,
                _ = shutdown.recv() => {
                    debug!("reader of channel {} exiting on shutdown signal", id);
                    break;
                }
            };
            match read {
                Ok(Some(frame)) => {
                    reader_channel.channel().mark_read();
                    reader_handler.received(&reader_channel, frame).await;
                }
                Ok(None) => {
                    debug!("peer closed channel {}", id);
                    break;
                }
                Err(e) => {
                    error!("read on channel {} failed: {}", id, e);
                    break;
                }
            }
        }
        reader_channel.force_close();
        on_close(id);
        debug!("reader task of channel {} exited", id);
    });

    exchange
}
