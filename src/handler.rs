//! Client connection handler
//!
//! Runs one connection through its whole life: username registration, key
//! exchange, presence announcement, frame dispatch, and teardown.
//!
//! The stream is split: this task reads lines and dispatches them, while a
//! spawned writer task drains the session's outbound channel to the client.
//! Every frame for the client, from this task or any other, goes through
//! that channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::broadcast::{broadcast, broadcast_presence};
use crate::crypto;
use crate::error::{AppError, PrivateMessageError};
use crate::identity::ServerIdentity;
use crate::protocol::{ClientFrame, ServerFrame, PRIVATE_SEPARATOR};
use crate::registry::{Session, SessionRegistry};
use crate::server::ChatServer;
use crate::types::{ConnectionId, Username};

/// Why an active session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Client sent the close frame
    Logout,
    /// End of stream, read error or writer gone
    Disconnected,
    /// Client sent a line with no known tag
    ProtocolViolation,
}

/// Handle a newly accepted connection
///
/// Owns the stream until the client leaves. By the time an error is
/// returned the session has already been torn down; the caller only needs
/// to act on errors that are `is_fatal`.
pub async fn handle_connection<S>(stream: S, server: ChatServer) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection_id = ConnectionId::new();
    let span = info_span!("connection", id = %connection_id, user = tracing::field::Empty);
    run_connection(stream, server).instrument(span).await
}

async fn run_connection<S>(stream: S, server: ChatServer) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let identity = server.identity().ensure().await?;
    let config = server.config();
    let timeout = config.handshake_timeout();

    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(config.max_line_length),
    );
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let proposed = match read_handshake_line(&mut lines, timeout).await {
        Ok(line) => line,
        Err(AppError::ConnectionClosed) => {
            debug!("Connection closed before sending a username");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // The greeting is queued before the session becomes visible, so nothing
    // broadcast by other sessions can reach the client ahead of it.
    let (tx, rx) = mpsc::channel(config.outbound_buffer.max(GREETING_FRAMES));
    let (modulus, exponent) = identity.public_components();
    for frame in [
        ServerFrame::Accepted,
        ServerFrame::KeyComponent(modulus),
        ServerFrame::KeyComponent(exponent),
    ] {
        tx.send(frame)
            .await
            .map_err(|_| AppError::ConnectionClosed)?;
    }

    let registered = match Username::parse(proposed) {
        Ok(username) => server.registry().try_register(username, tx).await,
        Err(e) => Err(e),
    };
    let session = match registered {
        Ok(session) => session,
        Err(e) => {
            info!("Rejecting login: {}", e);
            drop(rx);
            writer.send(ServerFrame::Rejected.to_string()).await?;
            SinkExt::<String>::close(&mut writer).await?;
            return Ok(());
        }
    };

    Span::current().record("user", session.username());
    info!("{} logged in", session.username());

    let write_task = tokio::spawn(write_loop(writer, rx).instrument(Span::current()));

    let outcome = match exchange_keys(&session, &mut lines, timeout).await {
        Ok(()) => {
            announce(server.registry(), &session).await;
            Ok(dispatch(server.registry(), &identity, &session, &mut lines).await)
        }
        Err(e) => Err(e),
    };

    teardown(server.registry(), &session).await;
    write_task.abort();

    match outcome {
        Ok(end) => {
            info!("{} disconnected ({:?})", session.username(), end);
            Ok(())
        }
        Err(e) => {
            warn!("{} dropped during key exchange: {}", session.username(), e);
            Err(e)
        }
    }
}

/// Frames queued ahead of registration: acceptance, modulus, exponent
const GREETING_FRAMES: usize = 3;

/// Read one handshake line, bounded by the handshake timeout
async fn read_handshake_line<R>(
    lines: &mut FramedRead<R, LinesCodec>,
    timeout: Option<Duration>,
) -> Result<String, AppError>
where
    R: AsyncRead + Unpin,
{
    let next = match timeout {
        Some(limit) => tokio::time::timeout(limit, lines.next())
            .await
            .map_err(|_| AppError::HandshakeTimeout)?,
        None => lines.next().await,
    };

    match next {
        Some(line) => Ok(line?),
        None => Err(AppError::ConnectionClosed),
    }
}

/// Receive the client's public key (modulus line, exponent line)
///
/// A key that does not parse leaves the session registered but unable to
/// receive private messages. Transport failures abort the session.
async fn exchange_keys<R>(
    session: &Session,
    lines: &mut FramedRead<R, LinesCodec>,
    timeout: Option<Duration>,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let modulus = read_handshake_line(lines, timeout).await?;
    let exponent = read_handshake_line(lines, timeout).await?;

    match crypto::parse_public_key(&modulus, &exponent) {
        Ok(key) => {
            session.set_public_key(key);
            debug!("Stored public key for {}", session.username());
        }
        Err(e) => {
            warn!(
                "Invalid public key from {}: {} - private messages disabled",
                session.username(),
                e
            );
        }
    }
    Ok(())
}

/// Tell everyone about the new session, and the new session about everyone
///
/// Peers and roster both come from the announced set under the presence
/// lock, so each pair of sessions learns about each other exactly once.
async fn announce(registry: &SessionRegistry, session: &Session) {
    let username = session.username();
    let _presence = registry.lock_presence().await;
    session.mark_announced();

    let notified = broadcast_presence(
        registry,
        ServerFrame::UserJoined(username.to_string()),
        username,
    )
    .await;
    debug!("Announced {} to {} sessions", username, notified);

    for other in registry.announced_except(username).await {
        let frame = ServerFrame::UserJoined(other.username().to_string());
        if session.send(frame).await.is_err() {
            break;
        }
    }
}

/// Read and route frames until the session ends
async fn dispatch<R>(
    registry: &SessionRegistry,
    identity: &ServerIdentity,
    session: &Session,
    lines: &mut FramedRead<R, LinesCodec>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let username = session.username();

    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = session.closed() => {
                debug!("Write task ended for {}", username);
                return SessionEnd::Disconnected;
            }
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!("Read error from {}: {}", username, e);
                return SessionEnd::Disconnected;
            }
            None => return SessionEnd::Disconnected,
        };

        match ClientFrame::parse(&line) {
            ClientFrame::Broadcast(body) => {
                let frame = ServerFrame::Broadcast {
                    from: username.to_string(),
                    body: body.to_string(),
                };
                let delivered = broadcast(registry, frame, username).await;
                debug!("Broadcast from {} to {} sessions", username, delivered);
            }
            ClientFrame::TypingStart => {
                broadcast(registry, ServerFrame::TypingStart(username.to_string()), username).await;
            }
            ClientFrame::TypingStop => {
                broadcast(registry, ServerFrame::TypingStop(username.to_string()), username).await;
            }
            ClientFrame::Private(payload) => {
                match relay_private(registry, identity, payload).await {
                    Ok(recipient) => debug!("Private message {} -> {}", username, recipient),
                    Err(e) => warn!("Dropped private message from {}: {}", username, e),
                }
            }
            ClientFrame::Close => return SessionEnd::Logout,
            ClientFrame::Unknown => {
                warn!("Unrecognized frame from {}: {:?}", username, line);
                return SessionEnd::ProtocolViolation;
            }
        }
    }
}

/// Decrypt a private message, re-encrypt its body for the named recipient,
/// and queue it for that recipient only
///
/// Returns the recipient's username.
async fn relay_private(
    registry: &SessionRegistry,
    identity: &ServerIdentity,
    payload: &str,
) -> Result<String, PrivateMessageError> {
    let plaintext = identity.decrypt_private(payload)?;
    let (recipient, body) = plaintext
        .split_once(PRIVATE_SEPARATOR)
        .ok_or(PrivateMessageError::MissingRecipient)?;

    let target = registry
        .get(recipient)
        .await
        .ok_or_else(|| PrivateMessageError::UnknownRecipient(recipient.to_string()))?;
    let key = target
        .public_key()
        .ok_or_else(|| PrivateMessageError::RecipientKeyUnknown(recipient.to_string()))?;

    let sealed = crypto::encrypt_private(body, key)?;
    target
        .send(ServerFrame::Private(sealed))
        .await
        .map_err(|_| PrivateMessageError::RecipientGone(recipient.to_string()))?;

    Ok(recipient.to_string())
}

/// Deregister the session and, if it was announced, announce its departure
async fn teardown(registry: &SessionRegistry, session: &Arc<Session>) {
    let username = session.username();
    let _presence = registry.lock_presence().await;
    registry.remove(session).await;

    if session.is_announced() {
        broadcast_presence(registry, ServerFrame::UserLeft(username.to_string()), username).await;
    }
}

/// Drain the outbound channel to the client
async fn write_loop<W>(mut writer: FramedWrite<W, LinesCodec>, mut rx: mpsc::Receiver<ServerFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if writer.send(frame.to_string()).await.is_err() {
            debug!("Client write failed, ending write task");
            break;
        }
    }

    let _ = SinkExt::<String>::close(&mut writer).await;
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use rsa::RsaPrivateKey;

    use super::*;

    fn server_identity() -> &'static ServerIdentity {
        static IDENTITY: OnceLock<ServerIdentity> = OnceLock::new();
        IDENTITY.get_or_init(|| ServerIdentity::generate(1024).unwrap())
    }

    fn client_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| crypto::generate_private_key(1024).unwrap())
    }

    async fn register(
        registry: &SessionRegistry,
        name: &str,
    ) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let session = registry
            .try_register(Username::parse(name).unwrap(), tx)
            .await
            .unwrap();
        (session, rx)
    }

    fn seal_for_server(plaintext: &str) -> String {
        crypto::encrypt_private(plaintext, server_identity().public_key()).unwrap()
    }

    #[tokio::test]
    async fn test_relay_private_reaches_only_recipient() {
        let registry = SessionRegistry::new();
        let (_alice, mut alice_rx) = register(&registry, "alice").await;
        let (bob, mut bob_rx) = register(&registry, "bob").await;
        bob.set_public_key(client_key().to_public_key());

        let recipient = relay_private(&registry, server_identity(), &seal_for_server("bob:secret"))
            .await
            .unwrap();
        assert_eq!(recipient, "bob");

        let Some(ServerFrame::Private(sealed)) = bob_rx.recv().await else {
            panic!("bob should receive a private frame");
        };
        assert_eq!(crypto::decrypt_private(&sealed, client_key()).unwrap(), "secret");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_private_keeps_colons_in_body() {
        let registry = SessionRegistry::new();
        let (bob, mut bob_rx) = register(&registry, "bob").await;
        bob.set_public_key(client_key().to_public_key());

        relay_private(&registry, server_identity(), &seal_for_server("bob:at 10:30"))
            .await
            .unwrap();

        let Some(ServerFrame::Private(sealed)) = bob_rx.recv().await else {
            panic!("bob should receive a private frame");
        };
        assert_eq!(crypto::decrypt_private(&sealed, client_key()).unwrap(), "at 10:30");
    }

    #[tokio::test]
    async fn test_relay_private_without_recipient_key() {
        let registry = SessionRegistry::new();
        let (_bob, mut bob_rx) = register(&registry, "bob").await;

        let err = relay_private(&registry, server_identity(), &seal_for_server("bob:secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, PrivateMessageError::RecipientKeyUnknown(n) if n == "bob"));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_private_unknown_recipient() {
        let registry = SessionRegistry::new();
        let err = relay_private(&registry, server_identity(), &seal_for_server("zoe:hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PrivateMessageError::UnknownRecipient(n) if n == "zoe"));
    }

    #[tokio::test]
    async fn test_relay_private_missing_separator() {
        let registry = SessionRegistry::new();
        let err = relay_private(&registry, server_identity(), &seal_for_server("no recipient"))
            .await
            .unwrap_err();
        assert!(matches!(err, PrivateMessageError::MissingRecipient));
    }

    #[tokio::test]
    async fn test_relay_private_garbage_payload() {
        let registry = SessionRegistry::new();
        let err = relay_private(&registry, server_identity(), "%%%")
            .await
            .unwrap_err();
        assert!(matches!(err, PrivateMessageError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_teardown_announces_only_when_joined() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = register(&registry, "alice").await;
        let (bob, _bob_rx) = register(&registry, "bob").await;
        let (carol, _carol_rx) = register(&registry, "carol").await;
        alice.mark_announced();
        bob.mark_announced();

        // carol never finished the key exchange
        teardown(&registry, &carol).await;
        assert!(!registry.contains("carol").await);
        assert!(alice_rx.try_recv().is_err());

        teardown(&registry, &bob).await;
        assert!(!registry.contains("bob").await);
        assert_eq!(
            alice_rx.recv().await,
            Some(ServerFrame::UserLeft("bob".into()))
        );
    }

    #[tokio::test]
    async fn test_unannounced_session_never_reaches_peers() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = register(&registry, "alice").await;
        announce(&registry, &alice).await;

        // bob registers and stalls in the key exchange while carol joins
        let (bob, mut bob_rx) = register(&registry, "bob").await;
        let (carol, mut carol_rx) = register(&registry, "carol").await;
        announce(&registry, &carol).await;

        assert_eq!(
            alice_rx.recv().await,
            Some(ServerFrame::UserJoined("carol".into()))
        );
        assert_eq!(
            carol_rx.recv().await,
            Some(ServerFrame::UserJoined("alice".into()))
        );
        assert!(carol_rx.try_recv().is_err());

        teardown(&registry, &bob).await;
        assert!(alice_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_announced_once_each() {
        let registry = SessionRegistry::new();
        let names: Vec<String> = (0..8).map(|i| format!("user{}", i)).collect();
        let mut joined = Vec::new();
        for name in &names {
            let (tx, rx) = mpsc::channel(32);
            let session = registry
                .try_register(Username::parse(name).unwrap(), tx)
                .await
                .unwrap();
            joined.push((session, rx));
        }

        let handles: Vec<_> = joined
            .iter()
            .map(|(session, _)| {
                let registry = registry.clone();
                let session = Arc::clone(session);
                tokio::spawn(async move { announce(&registry, &session).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for (session, rx) in &mut joined {
            let mut seen = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                let ServerFrame::UserJoined(name) = frame else {
                    panic!("unexpected frame {:?}", frame);
                };
                assert!(!seen.contains(&name), "{} announced twice", name);
                seen.push(name);
            }
            seen.sort();
            let mut expected: Vec<String> = names
                .iter()
                .filter(|n| n.as_str() != session.username())
                .cloned()
                .collect();
            expected.sort();
            assert_eq!(seen, expected);
        }
    }
}
