//! Public configuration for the RPC client, RPC server and device arbiter.
//!
//! All three are plain structs with sensible defaults and `with_*` setters.
//! Loading them from files or the environment is left to the application.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub use crate::retry::RetryConfig;

/// Well-known UDP port of the instrument device link.
pub const DEFAULT_LINK_PORT: u16 = 7968;

/// Largest RPC frame accepted by default (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Client connection and call parameters.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Server host name or IP address.
    pub address: String,

    /// Server TCP port.
    pub port: u16,

    /// How long a call waits for its response.
    ///
    /// Default: 10 seconds
    pub request_timeout: Duration,

    /// Timeout used for the `rpc_getMethods` call issued by `refresh()`.
    ///
    /// Default: 2 seconds
    pub refresh_timeout: Duration,

    /// Timeout for establishing the TCP connection.
    ///
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// Largest response frame the client accepts.
    pub max_frame_size: usize,

    /// Identifies this client implementation to the server.
    pub user_agent: String,

    /// Reconnect policy applied when the connection drops mid-call.
    ///
    /// `None` disables reconnecting; the default allows a single
    /// reconnect-and-resend attempt.
    pub retry_config: Option<RetryConfig>,
}

impl RpcConfig {
    // ---

    /// Create a config for the server at `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        // ---
        Self {
            address: address.into(),
            port,
            request_timeout: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            user_agent: format!("labwire/{}", env!("CARGO_PKG_VERSION")),
            retry_config: Some(RetryConfig::single_reconnect()),
        }
    }

    /// Set the per-call response timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the timeout used when refreshing the method list.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the user-agent sent on connect.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Configure (or disable with `None`) reconnect-on-reset behavior.
    pub fn with_retry(mut self, config: Option<RetryConfig>) -> Self {
        self.retry_config = config;
        self
    }
}

/// RPC server listener parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // ---
    /// Local address to listen on.
    pub bind_address: IpAddr,

    /// TCP port; `0` picks an ephemeral port.
    pub port: u16,

    /// Server name used in log output.
    pub name: String,

    /// Largest request frame the server accepts.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            name: "rpc-server".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    // ---

    /// Listen on a specific address.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Listen on a specific port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the server name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Device arbiter socket and scheduling parameters.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    // ---
    /// Local address the link socket binds to.
    pub bind_address: IpAddr,

    /// Local port the link socket binds to.
    ///
    /// Default: 7968
    pub port: u16,

    /// Port devices listen on; discovery broadcasts are sent here.
    ///
    /// Default: 7968
    pub device_port: u16,

    /// Destination address for discovery broadcasts.
    pub broadcast_address: IpAddr,

    /// Upper bound on how long one loop iteration waits for socket activity.
    ///
    /// Default: 500 ms
    pub poll_interval: Duration,

    /// Interval between sweeps of the correlation registry for expired entries.
    ///
    /// Default: 50 ms
    pub sweep_interval: Duration,

    /// Receive buffer size for a single datagram.
    pub max_datagram: usize,

    /// Re-broadcast a discovery probe this often while running.
    ///
    /// Default: `None` (discovery only runs when asked for)
    pub discovery_interval: Option<Duration>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_LINK_PORT,
            device_port: DEFAULT_LINK_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(50),
            max_datagram: 4096,
            discovery_interval: None,
        }
    }
}

impl ArbiterConfig {
    // ---

    /// Bind the link socket to a specific address.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Bind the link socket to a specific port (`0` for ephemeral).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Send device traffic and discovery broadcasts to this port.
    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    /// Send discovery packets to this address instead of the limited broadcast.
    pub fn with_broadcast_address(mut self, address: IpAddr) -> Self {
        self.broadcast_address = address;
        self
    }

    /// Set the registry sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Broadcast a discovery probe every `interval`, starting right away.
    pub fn with_discovery_interval(mut self, interval: Option<Duration>) -> Self {
        self.discovery_interval = interval;
        self
    }
}
