//! Gateway configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How long a publish target stays open waiting for acknowledgements.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Decode failures tolerated before a session is ejected.
pub const MAX_DECODE_ERRORS: u32 = 10;

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the WebSocket listener
    pub bind_addr: SocketAddr,
    /// Maximum client frame size in bytes
    pub max_message_size: usize,
    /// Lifetime of an EVENT/AUTH publish before its target is released
    pub publish_timeout: Duration,
    /// A session is closed once its decode error count exceeds this
    pub max_decode_errors: u32,
    /// Timeout for opening an upstream relay connection
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let port = env_parse::<u16>("PORT").unwrap_or(8000);

        let host = env_parse::<IpAddr>("MULTIPLEXER_BIND_HOST")
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let max_message_size =
            env_parse::<usize>("MULTIPLEXER_MAX_MESSAGE_SIZE").unwrap_or(512 * 1024); // 512 KB

        let connect_timeout = env_parse::<u64>("MULTIPLEXER_CONNECT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        Self {
            bind_addr: SocketAddr::new(host, port),
            max_message_size,
            publish_timeout: PUBLISH_TIMEOUT,
            max_decode_errors: MAX_DECODE_ERRORS,
            connect_timeout,
        }
    }
}

impl GatewayConfig {
    /// Override the bind address
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// Settings a single session needs, detached from the listener.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.max_message_size,
            publish_timeout: self.publish_timeout,
            max_decode_errors: self.max_decode_errors,
        }
    }
}

/// Per-session limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_message_size: usize,
    pub publish_timeout: Duration,
    pub max_decode_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512 * 1024,
            publish_timeout: PUBLISH_TIMEOUT,
            max_decode_errors: MAX_DECODE_ERRORS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
