//! Client-side connection layer for VFS daemons
//!
//! Every mount is served by a daemon process. To talk to one, a client asks
//! the broker bus for the daemon's private address and opens a peer-to-peer
//! connection to it. This crate owns that lifecycle:
//!
//! - [`RegistryService`] caches one connection per daemon identity, shared
//!   across async tasks, plus private per-thread caches for blocking callers
//! - [`FilterRegistry`] exports client-side interfaces (monitors and the
//!   like) onto every daemon connection exactly once
//! - [`CancelSubscription`] forwards local cancellation to the daemon as a
//!   `Cancel` for the serial of the call being abandoned
//! - connections lost on the daemon side are evicted and reported through an
//!   [`IdentityInvalidator`]
//!
//! The registry never retries on its own: a dead connection found in a
//! thread cache surfaces as [`VfsError::Stale`], which callers retry.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod establish;
pub mod filter;
pub mod identity;
pub mod proxy;
pub mod registry;
mod teardown;

#[cfg(test)]
mod test_support;

pub use cancel::{send_cancelled_sync, CancelSubscription};
pub use config::ClientConfig;
pub use connection::{
    CloseReason, Connection, ConnectionId, ExportedHandle, Interface, Invocation, MethodCall,
    PendingReply, Role,
};
pub use error::{complete_with_cancellable, Result, VfsError};
pub use establish::EstablishStage;
pub use filter::{FilterContext, FilterFactory, FilterRegistry};
pub use identity::{ChannelInvalidator, DaemonIdentity, IdentityInvalidator, NoopInvalidator};
pub use proxy::DaemonProxy;
pub use registry::RegistryService;

// Wire types callers need to implement interfaces
pub use vfs_protocol::{RpcError, DAEMON_PATH};
