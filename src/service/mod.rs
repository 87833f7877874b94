pub use app_error::{AppError, AppResult};
pub use config::{
    ClientConfig, DispatchPoolConfig, ExchangeConfig, ProtocolConfig, ServerConfig,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
