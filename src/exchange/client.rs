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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::exchange::channel::open_channel;
use crate::exchange::monitor::spawn_client_monitor;
use crate::exchange::{
    Correlator, ExchangeChannel, ExchangeHandler, Invoker, ResponseFuture, RoleTimer, TimerEvent,
};
use crate::network::Transporter;
use crate::protocol::{ExchangeCodec, RpcInvocation, SerializationRegistry};
use crate::{AppError, AppResult, ExchangeConfig};

/// Client side of the exchange layer: one remote address, one live
/// channel at a time, heartbeat and reconnect tasks on the role timer.
/// Cheap to clone, all clones share the same connection.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    config: ExchangeConfig,
    remote_addr: SocketAddr,
    transporter: Arc<dyn Transporter>,
    codec: Arc<ExchangeCodec>,
    correlator: Arc<Correlator>,
    timer: RoleTimer,
    handler: Arc<ExchangeHandler>,
    channel: RwLock<Option<Arc<ExchangeChannel>>>,
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ExchangeClient {
    /// Connects to `remote_addr` and starts the client's periodic
    /// tasks. The invoker serves calls the peer may issue back over
    /// the same connection, pass [`crate::NoService`] for a pure
    /// caller.
    pub async fn connect(
        remote_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> AppResult<ExchangeClient> {
        let codec = Arc::new(ExchangeCodec::new(&config.protocol, registry)?);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let timer = RoleTimer::new(
            "client",
            events_tx,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        let correlator = Arc::new(Correlator::new("client", timer.clone()));
        let handler = Arc::new(ExchangeHandler::new(
            correlator.clone(),
            invoker,
            &config.dispatch_pool,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        ));

        let inner = Arc::new(ClientInner {
            config,
            remote_addr,
            transporter,
            codec,
            correlator,
            timer: timer.clone(),
            handler,
            channel: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx.clone())),
            shutdown_complete_rx: tokio::sync::Mutex::new(Some(shutdown_complete_rx)),
        });

        inner.do_connect(false).await?;
        spawn_client_monitor(
            Arc::downgrade(&inner),
            events_rx,
            notify_shutdown,
            shutdown_complete_tx,
        );
        if inner.config.client.heartbeat_ms > 0 {
            timer
                .schedule(TimerEvent::HeartbeatTick, inner.heartbeat_tick())
                .await?;
        }
        if inner.config.client.reconnect {
            timer
                .schedule(TimerEvent::ReconnectTick, inner.reconnect_tick())
                .await?;
        }

        Ok(ExchangeClient { inner })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current_channel()
            .map(|channel| channel.is_connected())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Two-way call with the configured per-call timeout.
    pub async fn request(&self, invocation: RpcInvocation) -> AppResult<ResponseFuture> {
        let timeout = Duration::from_millis(self.inner.config.client.request_timeout_ms);
        self.request_with_timeout(invocation, timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        invocation: RpcInvocation,
        timeout: Duration,
    ) -> AppResult<ResponseFuture> {
        self.inner.active_channel()?.request(invocation, timeout).await
    }

    pub async fn send_one_way(
        &self,
        invocation: RpcInvocation,
        wait_for_flush: bool,
    ) -> AppResult<()> {
        self.inner
            .active_channel()?
            .send_one_way(invocation, wait_for_flush)
            .await
    }

    /// Tears down the current connection, if any, and establishes a
    /// fresh one.
    pub async fn reconnect(&self) -> AppResult<()> {
        self.inner.do_connect(true).await
    }

    /// Graceful close: drain the channel's pending calls up to
    /// `timeout`, then stop every task scoped to this client and wait
    /// for them to finish.
    pub async fn close(&self, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self.inner.channel.write().take();
        if let Some(channel) = channel {
            channel.close(timeout).await;
        }
        let _ = self.inner.notify_shutdown.send(());
        *self.inner.shutdown_complete_tx.lock() = None;
        let rx = self.inner.shutdown_complete_rx.lock().await.take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
        info!("client for {} closed", self.inner.remote_addr);
    }
}

impl ClientInner {
    pub(crate) fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    fn current_channel(&self) -> Option<Arc<ExchangeChannel>> {
        self.channel.read().clone()
    }

    fn active_channel(&self) -> AppResult<Arc<ExchangeChannel>> {
        self.current_channel().ok_or_else(|| {
            AppError::ChannelInactive(format!("no live channel to {}", self.remote_addr))
        })
    }

    /// Establishes the channel, replacing any existing one. With
    /// `force`, a currently connected channel is torn down first,
    /// which is how half-open connections are recovered.
    async fn do_connect(&self, force: bool) -> AppResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::ChannelInactive(format!(
                "client for {} is closed",
                self.remote_addr
            )));
        }
        if let Some(existing) = self.current_channel() {
            if existing.is_connected() && !force {
                return Ok(());
            }
            existing.force_close();
        }

        let connect_timeout = Duration::from_millis(self.config.client.connect_timeout_ms);
        let connected = self
            .transporter
            .connect(self.remote_addr, connect_timeout)
            .await?;
        let shutdown_complete_tx = self
            .shutdown_complete_tx
            .lock()
            .clone()
            .ok_or_else(|| {
                AppError::ChannelInactive(format!("client for {} is closing", self.remote_addr))
            })?;
        let exchange = open_channel(
            connected,
            &self.codec,
            &self.correlator,
            &self.handler,
            self.config.protocol.outbound_queue_size,
            self.config.protocol.read_buffer_size,
            Duration::from_millis(self.config.client.send_timeout_ms),
            self.notify_shutdown.clone(),
            shutdown_complete_tx,
            |_| {},
        );
        *self.channel.write() = Some(exchange);
        Ok(())
    }

    fn heartbeat_tick(&self) -> Duration {
        Duration::from_millis((self.config.client.heartbeat_ms / 3).max(100))
    }

    fn reconnect_tick(&self) -> Duration {
        Duration::from_millis((self.config.client.idle_timeout_ms / 3).max(100))
    }

    /// Emits a two-way heartbeat event once the connection has been
    /// silent in either direction for a full heartbeat interval.
    pub(crate) async fn on_heartbeat_tick(&self) {
        let interval = Duration::from_millis(self.config.client.heartbeat_ms);
        if let Some(channel) = self.current_channel() {
            if channel.is_connected()
                && (channel.channel().read_idle() >= interval
                    || channel.channel().write_idle() >= interval)
            {
                debug!("sending heartbeat on channel {}", channel.id());
                if let Err(e) = channel.send_heartbeat().await {
                    warn!("failed to send heartbeat on channel {}: {}", channel.id(), e);
                }
            }
        }
        let _ = self
            .timer
            .schedule(TimerEvent::HeartbeatTick, self.heartbeat_tick())
            .await;
    }

    /// Re-establishes a dropped connection, and forces a reconnect on
    /// a connection that has been read-idle past the idle threshold,
    /// which catches half-open sockets the OS never reported closed.
    pub(crate) async fn on_reconnect_tick(&self) {
        if !self.closed.load(Ordering::Acquire) {
            let idle_timeout = Duration::from_millis(self.config.client.idle_timeout_ms);
            let need = match self.current_channel() {
                None => true,
                Some(channel) => {
                    if !channel.is_connected() {
                        true
                    } else if channel.channel().read_idle() >= idle_timeout {
                        warn!(
                            "channel {} read-idle for {} ms, assuming half-open connection",
                            channel.id(),
                            channel.channel().read_idle().as_millis()
                        );
                        true
                    } else {
                        false
                    }
                }
            };
            if need {
                if let Err(e) = self.do_connect(true).await {
                    warn!("reconnect to {} failed: {}", self.remote_addr, e);
                }
            }
        }
        let _ = self
            .timer
            .schedule(TimerEvent::ReconnectTick, self.reconnect_tick())
            .await;
    }
}
