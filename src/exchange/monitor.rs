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

//! Consumers of the role timer. One monitor task per client or server
//! instance pulls expired events off the shared timer and runs the
//! matching periodic check, re-arming the tick afterwards. Holding the
//! owner only weakly lets a dropped role wind down without a cycle.

use std::sync::Weak;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::exchange::client::ClientInner;
use crate::exchange::server::ServerInner;
use crate::exchange::TimerEvent;
use crate::Shutdown;

pub(crate) fn spawn_client_monitor(
    inner: Weak<ClientInner>,
    mut events_rx: mpsc::Receiver<TimerEvent>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    tokio::spawn(async move {
        let _shutdown_complete_tx = shutdown_complete_tx;
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            let Some(client) = inner.upgrade() else {
                break;
            };
            match event {
                TimerEvent::CallTimeout { call_id } => client.correlator().on_timeout(call_id),
                TimerEvent::HeartbeatTick => client.on_heartbeat_tick().await,
                TimerEvent::ReconnectTick => client.on_reconnect_tick().await,
                TimerEvent::IdleTick => {}
            }
        }
        debug!("client monitor exited");
    });
}

pub(crate) fn spawn_server_monitor(
    inner: Weak<ServerInner>,
    mut events_rx: mpsc::Receiver<TimerEvent>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    tokio::spawn(async move {
        let _shutdown_complete_tx = shutdown_complete_tx;
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            let Some(server) = inner.upgrade() else {
                break;
            };
            match event {
                TimerEvent::CallTimeout { call_id } => server.correlator().on_timeout(call_id),
                TimerEvent::IdleTick => server.on_idle_tick().await,
                TimerEvent::HeartbeatTick | TimerEvent::ReconnectTick => {}
            }
        }
        debug!("server monitor exited");
    });
}
