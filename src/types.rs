//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identifier for one accepted connection
//! - `Username`: a validated display name

use std::fmt;

use uuid::Uuid;

use crate::error::RegistryError;
use crate::protocol::PRIVATE_SEPARATOR;

/// Unique connection identifier (newtype pattern)
///
/// Assigned before the username is known so that log lines from a
/// connection that never finishes the handshake can still be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display name chosen by a client during the handshake
///
/// Never empty and never contains the private-message separator, which
/// would make the user unaddressable by `recipient:body` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    /// Validate a proposed username
    pub fn parse(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.is_empty() || name.contains(PRIVATE_SEPARATOR) {
            return Err(RegistryError::InvalidUsername(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
