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

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, Invoker, ResponseFuture};
use crate::network::Transporter;
use crate::protocol::{RpcInvocation, SerializationRegistry};
use crate::{AppResult, ExchangeConfig};

/// One resurrection warning per this many requests, enough to show up
/// in the logs without flooding them.
const RESURRECTION_WARNING_PERIOD: u64 = 5000;

/// Defers the physical connect until the first send or request. Before
/// that, `is_connected` reports the configured optimistic initial
/// state so dependent code can proceed. A released shared client is
/// demoted to one of these with the warning flag set.
#[derive(Debug)]
pub struct LazyClient {
    remote_addr: SocketAddr,
    config: ExchangeConfig,
    transporter: Arc<dyn Transporter>,
    registry: Arc<SerializationRegistry>,
    invoker: Arc<dyn Invoker>,
    initial_connected: bool,
    warn_on_use: bool,
    request_count: AtomicU64,
    client: Mutex<Option<ExchangeClient>>,
}

impl LazyClient {
    pub fn new(
        remote_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> LazyClient {
        let initial_connected = config.client.lazy_initial_connected;
        Self::with_options(
            remote_addr,
            config,
            transporter,
            registry,
            invoker,
            initial_connected,
            false,
        )
    }

    pub(crate) fn with_options(
        remote_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
        initial_connected: bool,
        warn_on_use: bool,
    ) -> LazyClient {
        LazyClient {
            remote_addr,
            config,
            transporter,
            registry,
            invoker,
            initial_connected,
            warn_on_use,
            request_count: AtomicU64::new(0),
            client: Mutex::new(None),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The real client, connecting on first use. The connect lock also
    /// serializes concurrent first users, only one of them dials.
    async fn client(&self) -> AppResult<ExchangeClient> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }
        info!("lazy client connecting to {}", self.remote_addr);
        let client = ExchangeClient::connect(
            self.remote_addr,
            self.config.clone(),
            self.transporter.clone(),
            self.registry.clone(),
            self.invoker.clone(),
        )
        .await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    fn note_use(&self) {
        if self.warn_on_use {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if count % RESURRECTION_WARNING_PERIOD == 0 {
                warn!(
                    "request through a released client for {}, the connection is being resurrected",
                    self.remote_addr
                );
            }
        }
    }

    pub async fn request(&self, invocation: RpcInvocation) -> AppResult<ResponseFuture> {
        self.note_use();
        self.client().await?.request(invocation).await
    }

    pub async fn request_with_timeout(
        &self,
        invocation: RpcInvocation,
        timeout: Duration,
    ) -> AppResult<ResponseFuture> {
        self.note_use();
        self.client()
            .await?
            .request_with_timeout(invocation, timeout)
            .await
    }

    pub async fn send_one_way(
        &self,
        invocation: RpcInvocation,
        wait_for_flush: bool,
    ) -> AppResult<()> {
        self.note_use();
        self.client()
            .await?
            .send_one_way(invocation, wait_for_flush)
            .await
    }

    /// Before the first real connect this reports the configured
    /// initial state, afterwards the underlying client's state.
    pub fn is_connected(&self) -> bool {
        match self.client.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(client) => client.is_connected(),
                None => self.initial_connected,
            },
            Err(_) => self.initial_connected,
        }
    }

    pub async fn close(&self, timeout: Duration) {
        if let Some(client) = self.client.lock().await.take() {
            client.close(timeout).await;
        }
    }
}
