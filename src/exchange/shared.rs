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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, Invoker, LazyClient, ResponseFuture};
use crate::network::Transporter;
use crate::protocol::{RpcInvocation, SerializationRegistry};
use crate::{AppResult, ExchangeConfig};

#[derive(Debug)]
enum Backend {
    Active(ExchangeClient),
    /// the last reference was released, the connection reopens
    /// transparently on next genuine use
    Lazy(Arc<LazyClient>),
}

/// One physical connection shared by several logical call sites.
/// Acquire bumps the reference count, release drops it, and only the
/// release that reaches zero touches the connection: it is closed and
/// the client demoted to a lazy placeholder instead of being torn down
/// for good, so caller churn never thrashes connect/disconnect.
#[derive(Debug)]
pub struct SharedClient {
    remote_addr: SocketAddr,
    config: ExchangeConfig,
    transporter: Arc<dyn Transporter>,
    registry: Arc<SerializationRegistry>,
    invoker: Arc<dyn Invoker>,
    backend: RwLock<Backend>,
    refs: AtomicUsize,
}

impl SharedClient {
    pub async fn connect(
        remote_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> AppResult<Arc<SharedClient>> {
        let client = ExchangeClient::connect(
            remote_addr,
            config.clone(),
            transporter.clone(),
            registry.clone(),
            invoker.clone(),
        )
        .await?;
        Ok(Arc::new(SharedClient {
            remote_addr,
            config,
            transporter,
            registry,
            invoker,
            backend: RwLock::new(Backend::Active(client)),
            refs: AtomicUsize::new(0),
        }))
    }

    /// Lazy variant: no physical connect happens until the first send
    /// or request goes through.
    pub fn lazy(
        remote_addr: SocketAddr,
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> Arc<SharedClient> {
        let lazy = LazyClient::new(
            remote_addr,
            config.clone(),
            transporter.clone(),
            registry.clone(),
            invoker.clone(),
        );
        Arc::new(SharedClient {
            remote_addr,
            config,
            transporter,
            registry,
            invoker,
            backend: RwLock::new(Backend::Lazy(Arc::new(lazy))),
            refs: AtomicUsize::new(0),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Drops one reference. Only the release that reaches zero closes
    /// the underlying client and demotes it to a lazy placeholder with
    /// the reconnect task disabled and the resurrection warning on.
    pub async fn release(&self, timeout: Duration) {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(
                    "release on shared client for {} without a matching acquire",
                    self.remote_addr
                );
                return;
            }
            match self.refs.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current != 1 {
            return;
        }

        let mut backend = self.backend.write().await;
        if let Backend::Active(client) = &*backend {
            client.close(timeout).await;
            let mut demoted_config = self.config.clone();
            demoted_config.client.reconnect = false;
            demoted_config.client.lazy_connect = true;
            let lazy = LazyClient::with_options(
                self.remote_addr,
                demoted_config,
                self.transporter.clone(),
                self.registry.clone(),
                self.invoker.clone(),
                false,
                true,
            );
            *backend = Backend::Lazy(Arc::new(lazy));
            info!(
                "last reference to {} released, client demoted to lazy",
                self.remote_addr
            );
        }
    }

    pub async fn request(&self, invocation: RpcInvocation) -> AppResult<ResponseFuture> {
        match &*self.backend.read().await {
            Backend::Active(client) => client.request(invocation).await,
            Backend::Lazy(lazy) => lazy.request(invocation).await,
        }
    }

    pub async fn request_with_timeout(
        &self,
        invocation: RpcInvocation,
        timeout: Duration,
    ) -> AppResult<ResponseFuture> {
        match &*self.backend.read().await {
            Backend::Active(client) => client.request_with_timeout(invocation, timeout).await,
            Backend::Lazy(lazy) => lazy.request_with_timeout(invocation, timeout).await,
        }
    }

    pub async fn send_one_way(
        &self,
        invocation: RpcInvocation,
        wait_for_flush: bool,
    ) -> AppResult<()> {
        match &*self.backend.read().await {
            Backend::Active(client) => client.send_one_way(invocation, wait_for_flush).await,
            Backend::Lazy(lazy) => lazy.send_one_way(invocation, wait_for_flush).await,
        }
    }

    pub async fn is_connected(&self) -> bool {
        match &*self.backend.read().await {
            Backend::Active(client) => client.is_connected(),
            Backend::Lazy(lazy) => lazy.is_connected(),
        }
    }

    /// Whether a pool may hand this entry to another reference. A
    /// demoted lazy backend is still usable, it reopens on use, a
    /// closed active client is dead and gets replaced in place.
    pub(crate) async fn is_usable(&self) -> bool {
        match &*self.backend.read().await {
            Backend::Active(client) => !client.is_closed(),
            Backend::Lazy(_) => true,
        }
    }
}

/// Hands out clients per remote address. `connections = 0` selects the
/// shared pool of `shared_connections` reference-counted clients reused
/// by every caller of the same address, `connections = N` builds N
/// dedicated clients per fetch.
#[derive(Debug)]
pub struct SharedClientPool {
    config: ExchangeConfig,
    transporter: Arc<dyn Transporter>,
    registry: Arc<SerializationRegistry>,
    invoker: Arc<dyn Invoker>,
    shared: Mutex<HashMap<SocketAddr, Vec<Arc<SharedClient>>>>,
}

impl SharedClientPool {
    pub fn new(
        config: ExchangeConfig,
        transporter: Arc<dyn Transporter>,
        registry: Arc<SerializationRegistry>,
        invoker: Arc<dyn Invoker>,
    ) -> SharedClientPool {
        SharedClientPool {
            config,
            transporter,
            registry,
            invoker,
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the clients backing one logical reference to
    /// `remote_addr`, with one reference acquired on each. The caller
    /// releases them when the reference goes away.
    pub async fn fetch(&self, remote_addr: SocketAddr) -> AppResult<Vec<Arc<SharedClient>>> {
        let dedicated = self.config.client.connections;
        if dedicated > 0 {
            let mut clients = Vec::with_capacity(dedicated);
            for _ in 0..dedicated {
                let client = self.build_client(remote_addr).await?;
                client.acquire();
                clients.push(client);
            }
            return Ok(clients);
        }

        let want = self.config.client.shared_connections.max(1);
        let mut shared = self.shared.lock().await;
        let entry = shared.entry(remote_addr).or_default();
        for index in 0..want {
            let alive = match entry.get(index) {
                Some(client) => client.is_usable().await,
                None => false,
            };
            if !alive {
                let fresh = self.build_client(remote_addr).await?;
                if index < entry.len() {
                    // dead entries are replaced individually in place
                    warn!(
                        "replacing dead shared client {} for {}",
                        index, remote_addr
                    );
                    entry[index] = fresh;
                } else {
                    entry.push(fresh);
                }
            }
        }
        let clients: Vec<Arc<SharedClient>> = entry[..want].to_vec();
        for client in &clients {
            client.acquire();
        }
        Ok(clients)
    }

    async fn build_client(&self, remote_addr: SocketAddr) -> AppResult<Arc<SharedClient>> {
        if self.config.client.lazy_connect {
            return Ok(SharedClient::lazy(
                remote_addr,
                self.config.clone(),
                self.transporter.clone(),
                self.registry.clone(),
                self.invoker.clone(),
            ));
        }
        SharedClient::connect(
            remote_addr,
            self.config.clone(),
            self.transporter.clone(),
            self.registry.clone(),
            self.invoker.clone(),
        )
        .await
    }
}
