//! Error types for the chat server
//!
//! Defines connection-level errors, crypto and private-message routing
//! errors, registry errors and message send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Connection-level errors
///
/// Everything here ends the connection it occurred on. Only the key
/// generation variants reach beyond that connection (see `is_fatal`).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error on the client stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line framing error (includes oversized lines)
    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    /// The server keypair could not be generated (fatal to the process)
    #[error("Server key generation failed: {0}")]
    KeyGeneration(#[source] CryptoError),

    /// The key generation task panicked or was cancelled (fatal to the process)
    #[error("Server key generation task failed: {0}")]
    KeyGenerationTask(#[source] tokio::task::JoinError),

    /// Client did not answer a handshake step in time
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Client closed the stream during the handshake
    #[error("Connection closed during handshake")]
    ConnectionClosed,
}

impl AppError {
    /// Whether this error must stop the whole process, not just one connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::KeyGeneration(_) | AppError::KeyGenerationTask(_)
        )
    }
}

/// RSA and transport-encoding failures
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),

    #[error("Invalid key component: {0:?}")]
    InvalidKeyComponent(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[source] rsa::Error),

    #[error("Failed to decode base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Decryption failed - payload corrupted or encrypted for another key")]
    Decrypt(#[source] rsa::Error),

    #[error("Encryption failed: {0}")]
    Encrypt(#[source] rsa::Error),

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Reasons a private message is dropped instead of delivered
#[derive(Debug, Error)]
pub enum PrivateMessageError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Private message has no recipient separator")]
    MissingRecipient,

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Recipient {0} has no public key")]
    RecipientKeyUnknown(String),

    #[error("Recipient {0} disconnected")]
    RecipientGone(String),
}

/// Registration errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
