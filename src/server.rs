//! ChatServer shared state and accept loop
//!
//! `ChatServer` is the process-scoped state every connection handler works
//! against: the session registry, the lazily generated server identity and
//! the configuration. Cloning it is cheap; all clones share the same state.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::identity::LazyIdentity;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct ChatServer {
    registry: SessionRegistry,
    identity: Arc<LazyIdentity>,
    config: Arc<ServerConfig>,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            identity: Arc::new(LazyIdentity::new(config.key_bits)),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn identity(&self) -> &LazyIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run one client connection to completion
    pub async fn handle<S>(&self, stream: S) -> Result<(), AppError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        handle_connection(stream, self.clone()).await
    }

    /// Accept connections forever, one handler task per connection
    ///
    /// Exits the process if the server keypair cannot be generated.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let server = self.clone();

                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream).await {
                            if e.is_fatal() {
                                error!("{} - shutting down", e);
                                std::process::exit(1);
                            }
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
