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

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::exchange::channel::open_channel;
use crate::exchange::monitor::spawn_server_monitor;
use crate::exchange::{
    Correlator, ExchangeChannel, ExchangeHandler, Invoker, RoleTimer, TimerEvent,
};
use crate::network::{Acceptor, Transporter};
use crate::protocol::{ExchangeCodec, SerializationRegistry};
use crate::{AppResult, ExchangeConfig, Shutdown};

/// Server side of the exchange layer: accept loop with a connection
/// limit, one channel per accepted connection, idle-close task on the
/// role timer, graceful readonly-then-drain shutdown.
#[derive(Debug, Clone)]
pub struct ExchangeServer {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
pub(crate) struct ServerInner {
    config: ExchangeConfig,
    local_addr: SocketAddr,
    codec: Arc<ExchangeCodec>,
    correlator: Arc<Correlator>,
    timer: RoleTimer,
    handler: Arc<ExchangeHandler>,
    channels: Arc<DashMap<u64, Arc<ExchangeChannel>>>,
    notify_shutdown: broadcast::Sender<()>,
    stop_accept: Arc<Notify>,
    closed: AtomicBool,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ExchangeServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> AppResult<ExchangeServer> {
        let acceptor = transporter.bind(bind_addr).await?;
        let local_addr = acceptor.local_addr()?;

        let codec = Arc::new(ExchangeCodec::new(&config.protocol, registry)?);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let timer = RoleTimer::new(
            "server",
            events_tx,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        let correlator = Arc::new(Correlator::new("server", timer.clone()));
        let handler = Arc::new(ExchangeHandler::new(
            correlator.clone(),
            invoker,
            &config.dispatch_pool,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        ));

        let inner = Arc::new(ServerInner {
            config,
            local_addr,
            codec,
            correlator,
            timer: timer.clone(),
            handler,
            channels: Arc::new(DashMap::new()),
            notify_shutdown: notify_shutdown.clone(),
            stop_accept: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx.clone())),
            shutdown_complete_rx: tokio::sync::Mutex::new(Some(shutdown_complete_rx)),
        });

        spawn_accept_loop(inner.clone(), acceptor, shutdown_complete_tx.clone());
        spawn_server_monitor(
            Arc::downgrade(&inner),
            events_rx,
            notify_shutdown,
            shutdown_complete_tx,
        );
        if inner.config.server.idle_timeout_ms > 0 {
            timer
                .schedule(TimerEvent::IdleTick, inner.idle_tick())
                .await?;
        }

        info!("exchange server listening on {}", local_addr);
        Ok(ExchangeServer { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Graceful close: stop accepting, tell every peer to go read-only,
    /// wait for pending calls to drain up to `timeout`, then force
    /// everything down and wait for the scoped tasks to finish.
    pub async fn close(&self, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_accept.notify_one();

        if self.inner.config.server.send_readonly_event {
            // collect first, readers may remove entries while the
            // events are being queued
            let channels: Vec<Arc<ExchangeChannel>> = self
                .inner
                .channels
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for channel in channels {
                if let Err(e) = channel.send_readonly_event().await {
                    warn!(
                        "failed to send readonly event on channel {}: {}",
                        channel.id(),
                        e
                    );
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while self.inner.correlator.has_pending() && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }

        let channels: Vec<Arc<ExchangeChannel>> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in channels {
            channel.force_close();
        }
        self.inner.channels.clear();

        let _ = self.inner.notify_shutdown.send(());
        *self.inner.shutdown_complete_tx.lock() = None;
        let rx = self.inner.shutdown_complete_rx.lock().await.take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
        info!("exchange server on {} closed", self.inner.local_addr);
    }
}

impl ServerInner {
    pub(crate) fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    fn idle_tick(&self) -> Duration {
        Duration::from_millis((self.config.server.idle_timeout_ms / 3).max(100))
    }

    /// Closes channels silent in both directions beyond the idle
    /// timeout.
    pub(crate) async fn on_idle_tick(&self) {
        let idle_timeout = Duration::from_millis(self.config.server.idle_timeout_ms);
        let idle: Vec<Arc<ExchangeChannel>> = self
            .channels
            .iter()
            .filter(|entry| {
                let channel = entry.value().channel();
                channel.read_idle() >= idle_timeout && channel.write_idle() >= idle_timeout
            })
            .map(|entry| entry.value().clone())
            .collect();
        for channel in idle {
            warn!(
                "closing channel {} from {}, idle for more than {} ms",
                channel.id(),
                channel.peer_addr(),
                idle_timeout.as_millis()
            );
            self.channels.remove(&channel.id());
            channel.force_close();
        }
        let _ = self
            .timer
            .schedule(TimerEvent::IdleTick, self.idle_tick())
            .await;
    }
}

fn spawn_accept_loop(
    inner: Arc<ServerInner>,
    mut acceptor: Box<dyn Acceptor>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        let _shutdown_complete_tx = shutdown_complete_tx.clone();
        let limit_connections = Arc::new(Semaphore::new(inner.config.server.max_connections));
        let mut shutdown = Shutdown::new(inner.notify_shutdown.subscribe());
        let mut backoff = 1u64;

        loop {
            let permit = limit_connections.clone().acquire_owned().await.unwrap();

            let accepted = tokio::select! {
                accepted = acceptor.accept() => accepted,
                _ = inner.stop_accept.notified() => break,
                _ = shutdown.recv() => break,
            };
            let connected = match accepted {
                Ok(connected) => {
                    backoff = 1;
                    connected
                }
                Err(e) => {
                    if backoff > 64 {
                        error!("accept on {} keeps failing: {}", inner.local_addr, e);
                        break;
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, e);
                    time::sleep(Duration::from_secs(backoff)).await;
                    backoff *= 2;
                    continue;
                }
            };

            debug!("accepted connection from {}", connected.peer_addr);
            let channels = inner.channels.clone();
            let exchange = open_channel(
                connected,
                &inner.codec,
                &inner.correlator,
                &inner.handler,
                inner.config.protocol.outbound_queue_size,
                inner.config.protocol.read_buffer_size,
                Duration::from_millis(inner.config.server.send_timeout_ms),
                inner.notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
                move |id| {
                    // whether gracefully or unexpectedly closed,
                    // release the connection slot
                    channels.remove(&id);
                    drop(permit);
                },
            );
            inner.channels.insert(exchange.id(), exchange);
        }
        debug!("accept loop on {} exited", inner.local_addr);
    });
}
