//! Runtime configuration for the orchestration server

use std::time::Duration;

/// How long a fresh connection may stay without choosing a role
pub const ROLE_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Period of the safety-net sweep over pending connections
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_NAME_LENGTH: usize = 2;
pub const MAX_NAME_LENGTH: usize = 20;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub role_timeout: Duration,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            role_timeout: ROLE_SELECTION_TIMEOUT,
            sweep_interval: PENDING_SWEEP_INTERVAL,
        }
    }
}
