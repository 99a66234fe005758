//! Broadcast fanout
//!
//! Delivers one frame to every registered session except the sender.
//! Presence frames go only to sessions that have been announced.

use std::sync::Arc;

use tracing::debug;

use crate::protocol::ServerFrame;
use crate::registry::{Session, SessionRegistry};

/// Send `frame` to every session except `exclude`
///
/// Works on a snapshot of the registry taken under the read lock, so joins
/// and leaves during delivery never disturb the iteration. A session that
/// left in the meantime has a closed channel and is skipped.
///
/// Returns how many sessions the frame was queued for.
pub async fn broadcast(registry: &SessionRegistry, frame: ServerFrame, exclude: &str) -> usize {
    let recipients = registry.snapshot_except(exclude).await;
    fanout(recipients, &frame).await
}

/// Send a presence frame to every announced session except `exclude`
///
/// Callers hold the registry's presence lock across this call.
pub async fn broadcast_presence(
    registry: &SessionRegistry,
    frame: ServerFrame,
    exclude: &str,
) -> usize {
    let recipients = registry.announced_except(exclude).await;
    fanout(recipients, &frame).await
}

async fn fanout(recipients: Vec<Arc<Session>>, frame: &ServerFrame) -> usize {
    let mut delivered = 0;

    for session in recipients {
        match session.send(frame.clone()).await {
            Ok(()) => delivered += 1,
            Err(_) => debug!("Skipping {} - session closed", session.username()),
        }
    }

    delivered
}
