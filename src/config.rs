use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::options::{DEFAULT_RETRY_COUNT, DEFAULT_TIMEOUT};
use crate::tftp::TransferMode;

pub const DEFAULT_PORT: u16 = 69;

/// Size of the buffer the server receives requests into.
pub const DEFAULT_SERVER_BUFFER_SIZE: usize = 16384;

/// Suffix appended to the stem of every file the server writes.
pub const RECEIVED_SUFFIX: &str = "_received";

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the request socket binds to
    pub bind: IpAddr,

    pub port: u16,

    /// Receive buffer size of the request socket (bytes)
    pub buffer_size: usize,

    /// How long to wait for a packet before giving up on a transfer
    pub timeout: Duration,

    /// Directory received files are written to
    pub output_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_SERVER_BUFFER_SIZE,
            timeout: DEFAULT_TIMEOUT,
            output_dir: PathBuf::from("."),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_dir(mut self, output_dir: &Path) -> Self {
        self.output_dir = output_dir.to_path_buf();
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,

    pub port: u16,

    /// Bound on every wait for a reply, also advertised as the `timeout` option
    pub timeout: Duration,

    /// Advertised as the `retry` option. Nothing is retransmitted.
    pub retry_count: u32,

    pub mode: TransferMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            mode: TransferMode::Octet,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }
}
