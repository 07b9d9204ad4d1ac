//! Daemon identities and the invalidation collaborator

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Name of a daemon on the broker bus. Compared by exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonIdentity(String);

impl DaemonIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DaemonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DaemonIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DaemonIdentity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Told whenever a connection bound to an identity dies, so that routing and
/// mount information cached for that identity stops being trusted.
///
/// Implementations must not block: they are called from connection
/// teardown and from cache lookups.
pub trait IdentityInvalidator: Send + Sync {
    fn invalidate(&self, identity: &DaemonIdentity);
}

/// Discards invalidations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl IdentityInvalidator for NoopInvalidator {
    fn invalidate(&self, _identity: &DaemonIdentity) {}
}

/// Forwards invalidations into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelInvalidator {
    tx: mpsc::UnboundedSender<DaemonIdentity>,
}

impl ChannelInvalidator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DaemonIdentity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl IdentityInvalidator for ChannelInvalidator {
    fn invalidate(&self, identity: &DaemonIdentity) {
        // Receiver may have been dropped
        let _ = self.tx.send(identity.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality_is_exact() {
        assert_eq!(DaemonIdentity::new(":1.5"), DaemonIdentity::from(":1.5"));
        assert_ne!(DaemonIdentity::new(":1.5"), DaemonIdentity::new(":1.50"));
        assert_eq!(DaemonIdentity::new(":1.5").to_string(), ":1.5");
    }

    #[test]
    fn test_channel_invalidator_forwards() {
        let (invalidator, mut rx) = ChannelInvalidator::new();
        invalidator.invalidate(&DaemonIdentity::new("d1"));
        invalidator.invalidate(&DaemonIdentity::new("d2"));
        assert_eq!(rx.try_recv().unwrap(), DaemonIdentity::new("d1"));
        assert_eq!(rx.try_recv().unwrap(), DaemonIdentity::new("d2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_invalidator_survives_dropped_receiver() {
        let (invalidator, rx) = ChannelInvalidator::new();
        drop(rx);
        invalidator.invalidate(&DaemonIdentity::new("d1"));
    }
}
