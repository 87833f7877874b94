pub use worker_pool::{DispatchPool, PoolHandler};

mod worker_pool;
