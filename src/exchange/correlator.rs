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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::exchange::{RoleTimer, TimerEvent};
use crate::protocol::{Request, Response, Status};
use crate::{AppError, AppResult};

#[derive(Debug)]
struct PendingCall {
    channel_id: u64,
    completion: oneshot::Sender<AppResult<Response>>,
    created: Instant,
    sent: AtomicCell<Option<Instant>>,
    timeout: Duration,
}

/// The caller's handle on an in-flight two-way request.
#[derive(Debug)]
pub struct ResponseFuture {
    id: u64,
    rx: oneshot::Receiver<AppResult<Response>>,
}

impl ResponseFuture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> AppResult<Response> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // the correlator was torn down with the call still registered
            Err(_) => Err(AppError::ChannelInactive(format!(
                "call {} abandoned before completion",
                self.id
            ))),
        }
    }
}

/// Maps in-flight request ids to pending calls and owns their timeout
/// scheduling. One instance per client or server role, torn down with
/// it.
///
/// Every completion path (response arrival, timeout, channel close,
/// send failure) funnels through the same atomic remove-and-get on the
/// pending table, which is what guarantees exactly-once completion when
/// several of them race.
#[derive(Debug)]
pub struct Correlator {
    role: &'static str,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    timer: RoleTimer,
}

impl Correlator {
    pub fn new(role: &'static str, timer: RoleTimer) -> Correlator {
        Correlator {
            role,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            timer,
        }
    }

    /// Ids are unique per role and wrap on overflow.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a pending call for `request` and schedules its timeout
    /// check on the role timer.
    pub async fn register(
        &self,
        channel_id: u64,
        request: &Request,
        timeout: Duration,
    ) -> AppResult<ResponseFuture> {
        let (completion, rx) = oneshot::channel();
        let call = PendingCall {
            channel_id,
            completion,
            created: Instant::now(),
            sent: AtomicCell::new(None),
            timeout,
        };
        if let Some(stale) = self.pending.insert(request.id, call) {
            // ids wrap after 2^64 calls, a live collision means the
            // caller abandoned a call a full wrap ago
            let _ = stale.completion.send(Err(AppError::IllegalStateError(
                format!("request id {} was reused", request.id),
            )));
        }
        self.timer
            .schedule(TimerEvent::CallTimeout { call_id: request.id }, timeout)
            .await?;
        Ok(ResponseFuture { id: request.id, rx })
    }

    /// The writer flushed the request, from now on a timeout counts as
    /// server-side.
    pub fn mark_sent(&self, id: u64) {
        if let Some(call) = self.pending.get(&id) {
            call.sent.store(Some(Instant::now()));
        }
    }

    pub fn on_response(&self, response: Response) {
        match self.pending.remove(&response.id) {
            Some((id, call)) => {
                let outcome = outcome_from_response(response, &call);
                if call.completion.send(outcome).is_err() {
                    debug!("{} correlator: caller of call {} is gone", self.role, id);
                }
            }
            None => {
                // late reply after a timeout, or a duplicate
                debug!(
                    "{} correlator: dropping unexpected response for call {}",
                    self.role, response.id
                );
            }
        }
    }

    pub fn on_timeout(&self, id: u64) {
        if let Some((_, call)) = self.pending.remove(&id) {
            let sent = call.sent.load().is_some();
            let elapsed = call.created.elapsed();
            let message = if sent {
                format!(
                    "waiting server-side response timeout: call {} sent, elapsed {} ms, timeout {} ms",
                    id,
                    elapsed.as_millis(),
                    call.timeout.as_millis()
                )
            } else {
                format!(
                    "client-side send timeout: call {} was never flushed, elapsed {} ms, timeout {} ms",
                    id,
                    elapsed.as_millis(),
                    call.timeout.as_millis()
                )
            };
            warn!("{} correlator: {}", self.role, message);
            let _ = call.completion.send(Err(AppError::Timeout {
                message,
                sent,
                elapsed_ms: elapsed.as_millis() as u64,
            }));
        }
    }

    /// Fails every call still registered on a dying channel so no
    /// caller blocks indefinitely after a disconnect.
    pub fn on_channel_closed(&self, channel_id: u64) {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().channel_id == channel_id)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.completion.send(Err(AppError::ChannelInactive(format!(
                    "channel {} closed with call {} in flight",
                    channel_id, id
                ))));
            }
        }
    }

    /// The send never made it to the wire, fail the call with the send
    /// error.
    pub fn fail(&self, id: u64, error: AppError) {
        if let Some((_, call)) = self.pending.remove(&id) {
            let _ = call.completion.send(Err(error));
        }
    }

    /// Drops the registration without completing the future, used when
    /// the caller is handed the error directly.
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_on_channel(&self, channel_id: u64) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().channel_id == channel_id)
            .count()
    }
}

fn outcome_from_response(response: Response, call: &PendingCall) -> AppResult<Response> {
    let message = response.error_message.clone().unwrap_or_default();
    match response.status {
        Status::Ok => Ok(response),
        Status::ClientTimeout | Status::ServerTimeout => Err(AppError::Timeout {
            message,
            sent: response.status == Status::ServerTimeout,
            elapsed_ms: call.created.elapsed().as_millis() as u64,
        }),
        Status::ChannelInactive => Err(AppError::ChannelInactive(message)),
        Status::BadRequest => Err(AppError::BadRequest(message)),
        Status::BadResponse | Status::ClientError => Err(AppError::BadResponse(message)),
        Status::ServerThreadPoolExhausted => Err(AppError::Overloaded(message)),
        Status::ServiceNotFound | Status::ServiceError | Status::ServerError => {
            Err(AppError::ServiceError(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::protocol::{RpcInvocation, RpcResult};

    fn correlator() -> (Arc<Correlator>, mpsc::Receiver<TimerEvent>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(64);
        let timer = RoleTimer::new("test", events_tx, notify_shutdown, shutdown_complete_tx);
        (Arc::new(Correlator::new("test", timer)), events_rx)
    }

    fn two_way_request(correlator: &Correlator) -> Request {
        Request::invocation(
            correlator.next_request_id(),
            RpcInvocation::new("demo", "hi"),
        )
    }

    #[tokio::test]
    async fn test_response_completes_the_future() {
        let (correlator, _events) = correlator();
        let request = two_way_request(&correlator);
        let future = correlator
            .register(1, &request, Duration::from_secs(5))
            .await
            .unwrap();

        correlator.on_response(Response::ok(request.id, RpcResult::default()));
        let response = future.wait().await.unwrap();
        assert_eq!(response.id, request.id);
        assert!(!correlator.has_pending());
    }

    #[tokio::test]
    async fn test_error_status_maps_to_error() {
        let (correlator, _events) = correlator();
        let request = two_way_request(&correlator);
        let future = correlator
            .register(1, &request, Duration::from_secs(5))
            .await
            .unwrap();

        correlator.on_response(Response::error(
            request.id,
            Status::ServerThreadPoolExhausted,
            "busy",
        ));
        assert!(matches!(future.wait().await, Err(AppError::Overloaded(_))));
    }

    #[tokio::test]
    async fn test_timeout_distinguishes_sent_from_unsent() {
        let (correlator, _events) = correlator();

        let unsent = two_way_request(&correlator);
        let unsent_future = correlator
            .register(1, &unsent, Duration::from_millis(10))
            .await
            .unwrap();
        correlator.on_timeout(unsent.id);
        match unsent_future.wait().await {
            Err(AppError::Timeout { sent, .. }) => assert!(!sent),
            other => panic!("expected a timeout, got {:?}", other),
        }

        let sent = two_way_request(&correlator);
        let sent_future = correlator
            .register(1, &sent, Duration::from_millis(10))
            .await
            .unwrap();
        correlator.mark_sent(sent.id);
        correlator.on_timeout(sent.id);
        match sent_future.wait().await {
            Err(AppError::Timeout { sent, .. }) => assert!(sent),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_close_fails_only_its_calls() {
        let (correlator, _events) = correlator();
        let on_dying = two_way_request(&correlator);
        let dying_future = correlator
            .register(7, &on_dying, Duration::from_secs(5))
            .await
            .unwrap();
        let on_healthy = two_way_request(&correlator);
        let _healthy_future = correlator
            .register(8, &on_healthy, Duration::from_secs(5))
            .await
            .unwrap();

        correlator.on_channel_closed(7);
        assert!(matches!(
            dying_future.wait().await,
            Err(AppError::ChannelInactive(_))
        ));
        assert_eq!(correlator.pending_on_channel(8), 1);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_late_response_is_discarded() {
        let (correlator, _events) = correlator();
        let request = two_way_request(&correlator);
        let future = correlator
            .register(1, &request, Duration::from_millis(10))
            .await
            .unwrap();

        correlator.on_timeout(request.id);
        // the late reply finds no pending call and is dropped
        correlator.on_response(Response::ok(request.id, RpcResult::default()));
        assert!(matches!(future.wait().await, Err(AppError::Timeout { .. })));
    }

    /// All three completion triggers fire concurrently, the future must
    /// resolve exactly once and the table must end up empty.
    #[tokio::test]
    async fn test_exactly_once_completion_under_race() {
        for _ in 0..50 {
            let (correlator, _events) = correlator();
            let request = two_way_request(&correlator);
            let future = correlator
                .register(3, &request, Duration::from_secs(5))
                .await
                .unwrap();

            let id = request.id;
            let c1 = correlator.clone();
            let c2 = correlator.clone();
            let c3 = correlator.clone();
            let t1 =
                tokio::spawn(async move { c1.on_response(Response::ok(id, RpcResult::default())) });
            let t2 = tokio::spawn(async move { c2.on_timeout(id) });
            let t3 = tokio::spawn(async move { c3.on_channel_closed(3) });
            let (r1, r2, r3) = tokio::join!(t1, t2, t3);
            r1.unwrap();
            r2.unwrap();
            r3.unwrap();

            // exactly one outcome was delivered, whichever won the race
            let _ = future.wait().await;
            assert!(!correlator.has_pending());
        }
    }
}
