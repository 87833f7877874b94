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

use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::debug;

use crate::{AppError, AppResult};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A connected duplex byte stream, the exchange layer never touches
/// sockets directly.
pub type DynStream = Box<dyn AsyncStream>;

pub struct Connected {
    pub stream: DynStream,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Raw connect/bind collaborator. TCP is the in-tree default, anything
/// that yields a duplex byte stream can stand in.
pub trait Transporter: Debug + Send + Sync {
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = AppResult<Connected>> + Send + '_>>;

    fn bind(
        &self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = AppResult<Box<dyn Acceptor>>> + Send + '_>>;
}

pub trait Acceptor: Debug + Send {
    fn accept(&mut self) -> Pin<Box<dyn Future<Output = AppResult<Connected>> + Send + '_>>;

    fn local_addr(&self) -> AppResult<SocketAddr>;
}

#[derive(Debug, Default)]
pub struct TcpTransporter;

impl Transporter for TcpTransporter {
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = AppResult<Connected>> + Send + '_>> {
        Box::pin(async move {
            let stream = time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    AppError::Transport(format!(
                        "connect to {} timed out after {} ms",
                        addr,
                        timeout.as_millis()
                    ))
                })?
                .map_err(|e| AppError::Transport(format!("connect to {} failed: {}", addr, e)))?;
            stream
                .set_nodelay(true)
                .map_err(|e| AppError::Transport(format!("set_nodelay on {} failed: {}", addr, e)))?;
            let local_addr = stream
                .local_addr()
                .map_err(|e| AppError::Transport(e.to_string()))?;
            let peer_addr = stream
                .peer_addr()
                .map_err(|e| AppError::Transport(e.to_string()))?;
            debug!("connected {} -> {}", local_addr, peer_addr);
            Ok(Connected {
                stream: Box::new(stream),
                local_addr,
                peer_addr,
            })
        })
    }

    fn bind(
        &self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = AppResult<Box<dyn Acceptor>>> + Send + '_>> {
        Box::pin(async move {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| AppError::Transport(format!("bind {} failed: {}", addr, e)))?;
            debug!("listening on {}", listener.local_addr()?);
            Ok(Box::new(TcpAcceptor { listener }) as Box<dyn Acceptor>)
        })
    }
}

#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self) -> Pin<Box<dyn Future<Output = AppResult<Connected>> + Send + '_>> {
        Box::pin(async move {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| AppError::Transport(format!("accept failed: {}", e)))?;
            stream
                .set_nodelay(true)
                .map_err(|e| AppError::Transport(format!("set_nodelay failed: {}", e)))?;
            let local_addr = stream
                .local_addr()
                .map_err(|e| AppError::Transport(e.to_string()))?;
            Ok(Connected {
                stream: Box::new(stream),
                local_addr,
                peer_addr,
            })
        })
    }

    fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
