//! Server configuration
//!
//! Parsed from the command line, with every option also readable from the
//! environment.

use std::time::Duration;

use clap::Parser;

/// Default listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:8888";

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[arg(long, env = "CHAT_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Size in bits of the server RSA keypair
    #[arg(long, env = "CHAT_KEY_BITS", default_value_t = 2048)]
    pub key_bits: usize,

    /// Seconds to wait for each handshake line; 0 waits forever
    #[arg(long, env = "CHAT_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Longest inbound line accepted, in bytes
    #[arg(long, env = "CHAT_MAX_LINE_LENGTH", default_value_t = 64 * 1024)]
    pub max_line_length: usize,

    /// Frames buffered per client before senders wait
    #[arg(long, env = "CHAT_OUTBOUND_BUFFER", default_value_t = 32)]
    pub outbound_buffer: usize,
}

impl ServerConfig {
    pub fn new() -> Self {
        ServerConfig::parse()
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            key_bits: 2048,
            handshake_timeout_secs: 30,
            max_line_length: 64 * 1024,
            outbound_buffer: 32,
        }
    }
}
