//! Broadcast Chat Server Library
//!
//! A line-oriented TCP chat server. Clients register a unique username and
//! then exchange public broadcast messages and RSA-encrypted private
//! messages relayed through the server.
//!
//! # Features
//! - Username registration with uniqueness check
//! - RSA public key exchange with every client
//! - Broadcast chat messages
//! - Private messages, re-encrypted for the recipient
//! - Typing indicators
//! - Join/leave presence notifications
//!
//! # Protocol
//! One frame per line. The client sends its username and gets `OK` or
//! `INVALIDUSERNAME`, then the server's RSA modulus and exponent as decimal
//! lines, and answers with its own. After that, frames are tagged with
//! `BD`, `PC`, `W:`, `!W:`, `IN:`, `OUT:`, and `Bye` closes the session.
//!
//! # Architecture
//! - `ChatServer` holds the shared state: `SessionRegistry`, the lazily
//!   generated server keypair, and the configuration
//! - Each connection runs `handle_connection` in its own task, plus a
//!   writer task draining that session's `mpsc` channel
//! - The registry is a `RwLock`ed map; fanout works on snapshots
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use broadcast_chat_server::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8888").await.unwrap();
//!     ChatServer::new(ServerConfig::default()).serve(listener).await;
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use broadcast::broadcast;
pub use config::ServerConfig;
pub use error::{AppError, CryptoError, PrivateMessageError, RegistryError, SendError};
pub use handler::handle_connection;
pub use identity::{LazyIdentity, ServerIdentity};
pub use protocol::{ClientFrame, ServerFrame};
pub use registry::{Session, SessionRegistry};
pub use server::ChatServer;
pub use types::{ConnectionId, Username};
