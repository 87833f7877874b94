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
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::exchange::{Correlator, ExchangeChannel};
use crate::protocol::{
    DecodedFrame, Event, Message, Request, RequestBody, Response, RpcInvocation, RpcResult, Status,
};
use crate::utils::{DispatchPool, PoolHandler};
use crate::{AppError, AppResult, DispatchPoolConfig};

/// Business-dispatch collaborator: given a decoded invocation, produce
/// a result or an error asynchronously. The exchange layer turns either
/// into a response for two-way calls.
pub trait Invoker: Debug + Send + Sync {
    fn invoke(
        &self,
        invocation: RpcInvocation,
    ) -> Pin<Box<dyn Future<Output = AppResult<RpcResult>> + Send + '_>>;
}

/// Default invoker for roles that never serve calls, every invocation
/// is answered with a service-not-found error.
#[derive(Debug, Default)]
pub struct NoService;

impl Invoker for NoService {
    fn invoke(
        &self,
        invocation: RpcInvocation,
    ) -> Pin<Box<dyn Future<Output = AppResult<RpcResult>> + Send + '_>> {
        Box::pin(async move {
            Err(AppError::ServiceError(format!(
                "no service is exported here, rejecting {}.{}",
                invocation.service, invocation.method
            )))
        })
    }
}

#[derive(Debug)]
struct DispatchTask {
    channel: Arc<ExchangeChannel>,
    request: Request,
}

#[derive(Debug, Clone)]
struct DispatchHandler {
    invoker: Arc<dyn Invoker>,
}

impl PoolHandler<DispatchTask> for DispatchHandler {
    fn handle(&self, task: DispatchTask) -> impl Future<Output = ()> + Send {
        let invoker = self.invoker.clone();
        async move {
            let DispatchTask { channel, request } = task;
            let id = request.id;
            let two_way = request.two_way;
            let invocation = match request.body {
                RequestBody::Invocation(invocation) => invocation,
                // events and broken requests never reach the pool
                other => {
                    error!("non-invocation body dispatched for call {}: {:?}", id, other);
                    return;
                }
            };

            let outcome = invoker.invoke(invocation).await;
            if two_way {
                let response = match outcome {
                    Ok(result) => Response::ok(id, result),
                    // a handler error is a response, never a transport fault
                    Err(e) => Response::error(id, Status::ServiceError, e.to_string()),
                };
                if let Err(e) = channel.send(Message::Response(response), false).await {
                    error!(
                        "failed to send response for call {} on channel {}: {}",
                        id,
                        channel.id(),
                        e
                    );
                }
            } else if let Err(e) = outcome {
                // no caller is waiting on a one-way request
                warn!("one-way call {} failed: {}", id, e);
            }
        }
    }
}

/// Routes decoded frames: events are answered in place, business
/// requests go to the bounded dispatch pool, responses go to the
/// correlator, text spans are logged and dropped.
#[derive(Debug)]
pub struct ExchangeHandler {
    correlator: Arc<Correlator>,
    pool: DispatchPool<DispatchTask>,
}

impl ExchangeHandler {
    pub fn new(
        correlator: Arc<Correlator>,
        invoker: Arc<dyn Invoker>,
        config: &DispatchPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> ExchangeHandler {
        let pool = DispatchPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            DispatchHandler { invoker },
            config,
        );
        ExchangeHandler { correlator, pool }
    }

    pub async fn received(&self, channel: &Arc<ExchangeChannel>, frame: DecodedFrame) {
        match frame {
            DecodedFrame::Text(text) => {
                // legacy text commands are not served here
                info!(
                    "non-protocol input on channel {}: {:?}",
                    channel.id(),
                    text.trim()
                );
            }
            DecodedFrame::Message(Message::Request(request)) => {
                self.on_request(channel, request).await;
            }
            DecodedFrame::Message(Message::Response(response)) => {
                self.on_response(channel, response);
            }
        }
    }

    async fn on_request(&self, channel: &Arc<ExchangeChannel>, request: Request) {
        if request.event {
            self.on_event(channel, request).await;
            return;
        }

        if request.broken {
            let message = match &request.body {
                RequestBody::Broken(message) => message.clone(),
                _ => "undecodable request body".to_string(),
            };
            if request.two_way {
                let response = Response::error(request.id, Status::BadRequest, message);
                if let Err(e) = channel.send(Message::Response(response), false).await {
                    error!(
                        "failed to send bad-request response on channel {}: {}",
                        channel.id(),
                        e
                    );
                }
            } else {
                warn!(
                    "dropping broken one-way request {} on channel {}: {}",
                    request.id,
                    channel.id(),
                    message
                );
            }
            return;
        }

        let id = request.id;
        let two_way = request.two_way;
        let task = DispatchTask {
            channel: channel.clone(),
            request,
        };
        // route by connection so one channel's requests stay ordered
        if let Err(e) = self.pool.try_send(task, channel.id()) {
            if two_way {
                // a rejected caller gets an overloaded response, never
                // a dropped call or a severed connection
                let response =
                    Response::error(id, Status::ServerThreadPoolExhausted, e.to_string());
                if let Err(e) = channel.send(Message::Response(response), false).await {
                    error!(
                        "failed to send overloaded response on channel {}: {}",
                        channel.id(),
                        e
                    );
                }
            } else {
                warn!("dispatch pool rejected one-way call {}: {}", id, e);
            }
        }
    }

    async fn on_event(&self, channel: &Arc<ExchangeChannel>, request: Request) {
        match request.body {
            RequestBody::Event(Event::Heartbeat) => {
                if request.two_way {
                    // answered in place, business dispatch never sees it
                    let response = Response::heartbeat(request.id);
                    if let Err(e) = channel.send(Message::Response(response), false).await {
                        warn!(
                            "failed to answer heartbeat on channel {}: {}",
                            channel.id(),
                            e
                        );
                    }
                }
            }
            RequestBody::Event(Event::ReadOnly) => {
                info!("peer of channel {} went read-only", channel.id());
                channel.channel().set_readonly();
            }
            ref other => {
                warn!(
                    "dropping broken event request {} on channel {}: {:?}",
                    request.id,
                    channel.id(),
                    other
                );
            }
        }
    }

    fn on_response(&self, channel: &Arc<ExchangeChannel>, response: Response) {
        if response.event {
            // heartbeat replies stop here
            trace!("heartbeat response on channel {}", channel.id());
            return;
        }
        debug!(
            "response for call {} on channel {}",
            response.id,
            channel.id()
        );
        self.correlator.on_response(response);
    }
}
