//! Cancellation forwarding
//!
//! Cancelling a token only stops the local caller from waiting. To make the
//! daemon stop working on a call, the call's serial is forwarded to it in a
//! `Cancel` request on the same connection. Forwarding is best-effort:
//! failures are logged and never reach the caller, and cancelling a call the
//! daemon already finished is a no-op on its side.

use crate::connection::{Connection, MethodCall};
use crate::error::{complete_with_cancellable, Result, VfsError};
use crate::proxy::DaemonProxy;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Forwards a cancellation for one serial, at most once.
///
/// The listener runs on the connection's runtime, so the token may be
/// cancelled from any thread at any time, including after the call
/// completed. Dropping the subscription detaches it without forwarding.
#[derive(Debug)]
pub struct CancelSubscription {
    serial: u64,
    detach: Option<oneshot::Sender<()>>,
}

impl CancelSubscription {
    /// Subscribe for the most recent call sent on `conn` from this thread.
    ///
    /// Must be called right after the call was sent, with no await in
    /// between. Prefer [`subscribe_serial`](Self::subscribe_serial) with
    /// [`PendingReply::serial`](crate::PendingReply::serial) when the reply
    /// handle is at hand.
    pub fn subscribe(conn: &Arc<Connection>, token: &CancellationToken) -> Self {
        Self::subscribe_serial(conn, token, conn.last_serial())
    }

    pub fn subscribe_serial(conn: &Arc<Connection>, token: &CancellationToken, serial: u64) -> Self {
        let (detach, detached) = oneshot::channel::<()>();
        let token = token.clone();
        let conn = conn.clone();
        let runtime = conn.runtime().clone();

        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => forward_cancel(&conn, serial).await,
                _ = detached => debug!(conn = %conn.id(), serial, "Cancel listener detached"),
            }
        });

        Self {
            serial,
            detach: Some(detach),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Detach without forwarding. Same as dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for CancelSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            // Listener is gone if it already forwarded
            let _ = detach.send(());
        }
    }
}

async fn forward_cancel(conn: &Arc<Connection>, serial: u64) {
    debug!(conn = %conn.id(), serial, "Forwarding cancellation");
    if let Err(e) = DaemonProxy::new(conn.clone(), None).cancel(serial).await {
        warn!(conn = %conn.id(), serial, "Failed to forward cancellation: {}", e);
    }
}

/// Forward a cancellation for the last call this thread sent on `conn`,
/// blocking.
///
/// For callers outside the async flow. Must not be called from within the
/// connection's runtime.
pub fn send_cancelled_sync(conn: &Arc<Connection>) -> Result<()> {
    let serial = conn.last_serial();
    debug!(conn = %conn.id(), serial, "Forwarding cancellation synchronously");
    conn.runtime()
        .block_on(DaemonProxy::new(conn.clone(), None).cancel(serial))
}

impl Connection {
    /// Send `call` and wait for its reply, forwarding `cancel` to the peer
    /// if it fires before the reply arrives.
    ///
    /// When the token fires the caller gets `Cancelled` at once; the peer's
    /// eventual reply is discarded. A fired token also turns a reply that
    /// raced it into `Cancelled`.
    pub async fn call_cancellable(
        self: &Arc<Self>,
        call: MethodCall,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let pending = self.send(call).await?;
        let Some(token) = cancel else {
            return pending.wait().await;
        };

        let subscription = CancelSubscription::subscribe_serial(self, token, pending.serial());
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(VfsError::Cancelled),
            result = pending.wait() => result,
        };
        // The listener prefers a fired token over the detach signal, so a
        // cancellation seen here is still forwarded.
        subscription.unsubscribe();
        complete_with_cancellable(result, Some(token))
    }
}
