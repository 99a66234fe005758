//! Line protocol definitions
//!
//! Every frame is one line of text: a literal, case-sensitive tag followed
//! by a payload. `ClientFrame` is parsed from inbound lines, `ServerFrame`
//! is rendered to outbound lines through its `Display` impl.

use std::fmt;

/// Username rejected (taken or invalid)
pub const INVALID_USERNAME: &str = "INVALIDUSERNAME";
/// Username accepted
pub const USERNAME_OK: &str = "OK";
/// Public chat message
pub const BROADCAST: &str = "BD";
/// Typing started
pub const TYPING_START: &str = "W:";
/// Typing stopped
pub const TYPING_STOP: &str = "!W:";
/// User joined / is present
pub const USER_JOINED: &str = "IN:";
/// User left
pub const USER_LEFT: &str = "OUT:";
/// Logout (exact match)
pub const CLOSE: &str = "Bye";
/// Encrypted private message
pub const PRIVATE: &str = "PC";

/// Separates the recipient from the body inside a decrypted private
/// message, and the sender from the body in a broadcast
pub const PRIVATE_SEPARATOR: char = ':';

/// Client → Server frame, borrowed from the inbound line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    /// Public chat message body
    Broadcast(&'a str),
    /// Base64 ciphertext for the server key
    Private(&'a str),
    TypingStart,
    TypingStop,
    /// Explicit logout
    Close,
    /// Anything without a known tag
    Unknown,
}

impl<'a> ClientFrame<'a> {
    /// Classify an inbound line by its leading tag
    pub fn parse(line: &'a str) -> Self {
        if let Some(body) = line.strip_prefix(BROADCAST) {
            ClientFrame::Broadcast(body)
        } else if let Some(payload) = line.strip_prefix(PRIVATE) {
            ClientFrame::Private(payload)
        } else if line.starts_with(TYPING_START) {
            ClientFrame::TypingStart
        } else if line.starts_with(TYPING_STOP) {
            ClientFrame::TypingStop
        } else if line == CLOSE {
            ClientFrame::Close
        } else {
            ClientFrame::Unknown
        }
    }
}

/// Server → Client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Username accepted
    Accepted,
    /// Username taken or invalid
    Rejected,
    /// One decimal component of the server public key (modulus, then exponent)
    KeyComponent(String),
    /// Public chat message relayed from `from`
    Broadcast { from: String, body: String },
    TypingStart(String),
    TypingStop(String),
    /// `username` joined, or was already present when the recipient joined
    UserJoined(String),
    UserLeft(String),
    /// Base64 ciphertext encrypted for the recipient's key
    Private(String),
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::Accepted => f.write_str(USERNAME_OK),
            ServerFrame::Rejected => f.write_str(INVALID_USERNAME),
            ServerFrame::KeyComponent(value) => f.write_str(value),
            ServerFrame::Broadcast { from, body } => {
                write!(f, "{BROADCAST}{from}{PRIVATE_SEPARATOR}{body}")
            }
            ServerFrame::TypingStart(username) => write!(f, "{TYPING_START}{username}"),
            ServerFrame::TypingStop(username) => write!(f, "{TYPING_STOP}{username}"),
            ServerFrame::UserJoined(username) => write!(f, "{USER_JOINED}{username}"),
            ServerFrame::UserLeft(username) => write!(f, "{USER_LEFT}{username}"),
            ServerFrame::Private(payload) => write!(f, "{PRIVATE}{payload}"),
        }
    }
}
