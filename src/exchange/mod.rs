pub use channel::ExchangeChannel;
pub use client::ExchangeClient;
pub use correlator::{Correlator, ResponseFuture};
pub use handler::{ExchangeHandler, Invoker, NoService};
pub use lazy::LazyClient;
pub use server::ExchangeServer;
pub use shared::{SharedClient, SharedClientPool};
pub use timer::{RoleTimer, TimerEvent};

mod channel;
mod client;
mod correlator;
mod handler;
mod lazy;
mod monitor;
mod server;
mod shared;
mod timer;
