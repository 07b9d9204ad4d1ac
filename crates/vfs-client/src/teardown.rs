//! Reaction to lost peer connections

use crate::connection::{CloseReason, Connection};
use crate::identity::IdentityInvalidator;
use crate::registry::AsyncConnections;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Attach the teardown hook to a freshly established connection.
///
/// When the connection closes and is bound to a daemon identity, the
/// identity is invalidated and the connection is evicted from `registry`.
/// Connections cached per thread pass no registry; their next lookup finds
/// them dead.
pub(crate) fn attach(
    conn: &Connection,
    registry: Option<Weak<AsyncConnections>>,
    invalidator: Arc<dyn IdentityInvalidator>,
) {
    conn.on_close(move |conn, reason| {
        let Some(identity) = conn.identity().cloned() else {
            debug!(conn = %conn.id(), reason = ?reason, "Unbound connection closed");
            return;
        };
        match reason {
            CloseReason::Local => debug!(conn = %conn.id(), identity = %identity, "Connection closed locally"),
            reason => info!(conn = %conn.id(), identity = %identity, reason = ?reason, "Lost connection to daemon"),
        }

        if conn.claim_teardown() {
            invalidator.invalidate(&identity);
        }
        if let Some(registry) = registry.and_then(|weak| weak.upgrade()) {
            registry.evict(&identity, conn.id());
        }
    });
}
