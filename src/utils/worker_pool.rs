use std::any::type_name;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, DispatchPoolConfig, Shutdown};

/// Handler trait for processing dispatched tasks.
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// A bounded worker pool with multiple independent task channels. Tasks
/// are routed by a caller-supplied key, so all work for one connection
/// lands on the same channel and stays in arrival order. A full channel
/// rejects instead of queueing without bound, the caller converts the
/// rejection into an overloaded response.
#[derive(Debug)]
pub struct DispatchPool<T> {
    channels: Arc<HashMap<usize, TaskChannel<T>>>,
}

#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> DispatchPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        config: &DispatchPoolConfig,
    ) -> Self {
        let num_channels = if config.num_channels <= 0 {
            num_cpus::get()
        } else {
            config.num_channels as usize
        };
        let channels = Self::spawn_channels_with_monitor(
            num_channels,
            config.channel_capacity,
            Duration::from_secs(config.monitor_interval_secs),
            Duration::from_millis(config.worker_check_timeout_ms),
            notify_shutdown,
            shutdown_complete_tx,
            handler,
        );

        Self { channels }
    }

    /// Route a task by key without waiting. A full channel is a
    /// rejection, never a silently dropped task.
    pub fn try_send(&self, task: T, route_key: u64) -> AppResult<()> {
        let channel_id = (route_key % self.channels.len() as u64) as usize;
        let sender = &self
            .channels
            .get(&channel_id)
            .expect("channel not found")
            .sender;
        sender.try_send(task).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => AppError::Overloaded(format!(
                "dispatch channel {} is full ({} queued)",
                channel_id,
                sender.len()
            )),
            async_channel::TrySendError::Closed(_) => {
                AppError::ChannelSendError(format!("dispatch channel {} is closed", channel_id))
            }
        })
    }

    /// Route a task by key, waiting for capacity. Used by callers that
    /// prefer backpressure over rejection.
    pub async fn send(&self, task: T, route_key: u64) -> AppResult<()> {
        let channel_id = (route_key % self.channels.len() as u64) as usize;
        self.channels
            .get(&channel_id)
            .expect("channel not found")
            .sender
            .send(task)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        num_channels: usize,
        channel_capacity: usize,
        monitor_interval: Duration,
        worker_check_timeout: Duration,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
    ) -> Arc<HashMap<usize, TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(num_channels);
        let mut channels = HashMap::with_capacity(num_channels);

        // one dedicated worker per channel keeps per-key ordering
        for id in 0..num_channels {
            let (sender, receiver) = async_channel::bounded(channel_capacity);
            let worker = Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
                shutdown_complete_tx.clone(),
            );
            workers.push(worker);
            channels.insert(id, TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);
        Self::spawn_monitor(
            workers,
            channels.clone(),
            notify_shutdown,
            shutdown_complete_tx,
            handler,
            monitor_interval,
            worker_check_timeout,
        );

        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            // dropped when the worker exits, unblocks the shutdown drain
            let _shutdown_complete_tx = shutdown_complete_tx;
            debug!("dispatch worker {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("dispatch worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    /// Dispatched work comes from the peer and can panic the worker, a
    /// dead worker is restarted on the surviving receiver.
    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<HashMap<usize, TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        monitor_interval: Duration,
        worker_check_timeout: Duration,
    ) {
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx.clone();
            let mut interval = time::interval(monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("dispatch pool monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("dispatch worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("dispatch worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("dispatch worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        channels.get(&worker.id).unwrap().receiver.clone(),
                                        shutdown_complete_tx.clone(),
                                    );
                                    debug!("dispatch worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("dispatch worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("dispatch pool monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("dispatch worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("dispatch worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "dispatch worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct TestHandler {
        counter: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for TestHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let counter = self.counter.clone();
            async move {
                counter.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    fn test_config(num_channels: i8, channel_capacity: usize) -> DispatchPoolConfig {
        DispatchPoolConfig {
            channel_capacity,
            num_channels,
            monitor_interval_secs: 1,
            worker_check_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_routed_tasks_are_processed() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };

        let pool = DispatchPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            handler.clone(),
            &test_config(2, 10),
        );
        assert_eq!(pool.channel_count(), 2);

        pool.try_send(1, 0).unwrap();
        pool.try_send(2, 1).unwrap();
        pool.send(3, 7).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_full_channel_rejects_with_overloaded() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        #[derive(Clone)]
        struct StallHandler;
        impl PoolHandler<i32> for StallHandler {
            fn handle(&self, _task: i32) -> impl Future<Output = ()> + Send {
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }

        let pool = DispatchPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            StallHandler,
            &test_config(1, 1),
        );

        // first task occupies the worker, second fills the channel
        pool.try_send(1, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.try_send(2, 0).unwrap();
        let rejected = pool.try_send(3, 0);
        assert!(matches!(rejected, Err(AppError::Overloaded(_))));
    }

    #[tokio::test]
    async fn test_worker_panic_recovery() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        #[derive(Clone)]
        struct PanicHandler {
            counter: Arc<AtomicI32>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let counter = self.counter.clone();
                async move {
                    if should_panic {
                        panic!("test panic");
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let handler = PanicHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };
        let pool = DispatchPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            handler.clone(),
            &test_config(1, 10),
        );

        pool.try_send(true, 0).unwrap();
        // the monitor notices the dead worker and restarts it
        tokio::time::sleep(Duration::from_millis(1500)).await;

        pool.try_send(false, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.counter.load(Ordering::SeqCst), 1);
    }
}
