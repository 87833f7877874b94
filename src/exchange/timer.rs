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

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;
use tracing::debug;

use crate::{AppError, AppResult, Shutdown};

/// What a timer expiry means to the role that scheduled it. Call
/// timeouts are one-shot, the periodic ticks are re-armed by whoever
/// consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    CallTimeout { call_id: u64 },
    HeartbeatTick,
    ReconnectTick,
    IdleTick,
}

#[derive(Debug)]
struct TimerCmd {
    event: TimerEvent,
    delay: Duration,
}

/// One coarse-grained timer per role. Every call timeout and every
/// periodic task of a client or server instance goes through a single
/// delay queue driven by one task, never one timer task per call or
/// per connection.
#[derive(Debug, Clone)]
pub struct RoleTimer {
    name: &'static str,
    cmd_tx: mpsc::Sender<TimerCmd>,
}

impl RoleTimer {
    pub fn new(
        name: &'static str,
        events_tx: mpsc::Sender<TimerEvent>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> RoleTimer {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<TimerCmd>(1024);
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            let mut delay_queue: DelayQueue<TimerEvent> = DelayQueue::new();
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        delay_queue.insert(cmd.event, cmd.delay);
                    }
                    Some(expired) = delay_queue.next() => {
                        if events_tx.send(expired.into_inner()).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("{} role timer exited", name);
        });

        RoleTimer { name, cmd_tx }
    }

    pub async fn schedule(&self, event: TimerEvent, delay: Duration) -> AppResult<()> {
        self.cmd_tx
            .send(TimerCmd { event, delay })
            .await
            .map_err(|_| {
                AppError::ChannelSendError(format!("{} role timer is gone", self.name))
            })
    }
}
