use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Client-role settings. All intervals are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// per-call wait for a response
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// upper bound for a caller that waits for flush confirmation
    pub send_timeout_ms: u64,
    /// a two-way heartbeat event is emitted after this much silence,
    /// 0 disables the heartbeat task
    pub heartbeat_ms: u64,
    /// read-idle span after which the connection is considered half-open
    /// and is re-established
    pub idle_timeout_ms: u64,
    pub reconnect: bool,
    /// defer the physical connect until the first send/request
    pub lazy_connect: bool,
    /// what a lazy client reports as its connection state before the
    /// first real connect
    pub lazy_initial_connected: bool,
    /// dedicated connections per logical reference, 0 selects the
    /// shared pool
    pub connections: usize,
    /// size of the shared pool per remote address
    pub shared_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            connect_timeout_ms: 3000,
            send_timeout_ms: 1000,
            heartbeat_ms: 60_000,
            idle_timeout_ms: 180_000,
            reconnect: true,
            lazy_connect: false,
            lazy_initial_connected: true,
            connections: 0,
            shared_connections: 1,
        }
    }
}

/// Server-role settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub send_timeout_ms: u64,
    /// channels silent beyond this are closed by the idle check task
    pub idle_timeout_ms: u64,
    /// broadcast a readonly event to all peers before a graceful close
    pub send_readonly_event: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 512,
            send_timeout_ms: 1000,
            idle_timeout_ms: 180_000,
            send_readonly_event: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// ceiling for a single frame body, checked before the body is
    /// buffered on decode and before the header is written on encode
    pub max_payload_size: usize,
    /// name of the body serialization, resolved through the registry
    pub serialization: String,
    pub read_buffer_size: usize,
    /// capacity of the per-channel outbound queue
    pub outbound_queue_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 8 * 1024 * 1024,
            serialization: "binary".to_string(),
            read_buffer_size: 4 * 1024,
            outbound_queue_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPoolConfig {
    pub channel_capacity: usize,
    /// 0 picks one channel per cpu
    pub num_channels: i8,
    pub monitor_interval_secs: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for DispatchPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval_secs: 5,
            worker_check_timeout_ms: 200,
        }
    }
}

/// Complete configuration for one exchange role. Constructed in code or
/// loaded from a TOML file, then passed explicitly into the client and
/// server builders.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub dispatch_pool: DispatchPoolConfig,
}

impl ExchangeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ExchangeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let exchange_config: ExchangeConfig = config.try_deserialize()?;

        Ok(exchange_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExchangeConfig::default();
        assert_eq!(config.client.request_timeout_ms, 1000);
        assert_eq!(config.client.idle_timeout_ms, config.client.heartbeat_ms * 3);
        assert_eq!(config.client.connections, 0);
        assert_eq!(config.protocol.max_payload_size, 8 * 1024 * 1024);
        assert_eq!(config.protocol.serialization, "binary");
    }

    #[test]
    fn test_missing_config_file() {
        let result = ExchangeConfig::set_up_config("no/such/file");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
