use serde::Deserialize;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

pub const DEFAULT_IDENTITY: &str = "sip:34020000002000000001@3402000000";

/// Startup settings of a [`crate::Server`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub udp_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    /// Address placed in From on requests this server issues.
    pub identity: String,
    /// Host written into Via; resolved from the interfaces when unset.
    pub host: Option<IpAddr>,
    pub transaction_ttl_secs: u64,
    pub sweep_interval_ms: u64,
    pub parser_queue_capacity: usize,
    pub max_concurrent_handlers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            udp_addr: Some(SocketAddr::from(([0, 0, 0, 0], 5060))),
            tcp_addr: Some(SocketAddr::from(([0, 0, 0, 0], 5060))),
            identity: DEFAULT_IDENTITY.to_string(),
            host: None,
            transaction_ttl_secs: 32,
            sweep_interval_ms: 1000,
            parser_queue_capacity: 1024,
            max_concurrent_handlers: 1024,
        }
    }
}

impl ServerConfig {
    pub fn transaction_ttl(&self) -> Duration {
        Duration::from_secs(self.transaction_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
