//! Connection registries
//!
//! [`RegistryService`] hands out one peer-to-peer connection per daemon
//! identity. There are two caches:
//!
//! - the async cache, shared by every task in the process, keyed by identity
//!   and purged by the teardown hook when a peer goes away;
//! - per-thread caches for blocking callers. Each thread owns its own broker
//!   bus connection and daemon connections; nothing is shared between
//!   threads, and everything is released when the thread exits.
//!
//! Concurrent async lookups for the same identity may both establish a
//! connection. The race is resolved at insertion: whoever installs first
//! wins, the other closes its redundant connection and uses the winner's.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{complete_with_cancellable, Result, VfsError};
use crate::establish::{connect_broker, establish, with_cancel};
use crate::filter::FilterRegistry;
use crate::identity::{DaemonIdentity, IdentityInvalidator, NoopInvalidator};
use crate::teardown;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static SERVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// The shared identity to connection map.
#[derive(Default)]
pub(crate) struct AsyncConnections {
    connections: Mutex<HashMap<DaemonIdentity, Arc<Connection>>>,
}

impl AsyncConnections {
    /// Live cached connection for `identity`.
    pub(crate) fn lookup(&self, identity: &DaemonIdentity) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .get(identity)
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Install `conn` unless a live connection is already cached.
    ///
    /// Returns the cached connection and, if `conn` lost, `conn` itself so
    /// the caller can close it. The winner is bound to `identity`.
    pub(crate) fn install(
        &self,
        identity: &DaemonIdentity,
        conn: Arc<Connection>,
    ) -> (Arc<Connection>, Option<Arc<Connection>>) {
        let replaced = {
            let mut connections = self.connections.lock();
            if let Some(existing) = connections.get(identity).filter(|c| !c.is_closed()) {
                return (existing.clone(), Some(conn));
            }
            conn.bind_identity(identity.clone());
            connections.insert(identity.clone(), conn.clone())
        };
        if let Some(dead) = replaced {
            debug!(identity = %identity, conn = %dead.id(), "Replaced dead cache entry");
        }
        (conn, None)
    }

    /// Remove the entry for `identity` if it still holds connection `id`.
    pub(crate) fn evict(
        &self,
        identity: &DaemonIdentity,
        id: ConnectionId,
    ) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        match connections.get(identity) {
            Some(current) if current.id() == id => {
                debug!(identity = %identity, conn = %id, "Evicted cache entry");
                connections.remove(identity)
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}

#[derive(Default)]
struct ThreadConnections {
    broker: Option<Arc<Connection>>,
    daemons: HashMap<DaemonIdentity, Arc<Connection>>,
}

thread_local! {
    /// Per-thread caches, one slot per registry service.
    static THREAD_CONNECTIONS: RefCell<HashMap<u64, ThreadConnections>> =
        RefCell::new(HashMap::new());
}

struct Shared {
    id: u64,
    config: ClientConfig,
    runtime: Handle,
    connections: Arc<AsyncConnections>,
    broker: Mutex<Option<Arc<Connection>>>,
    filters: Arc<FilterRegistry>,
    invalidator: Arc<dyn IdentityInvalidator>,
}

/// Process-wide connection registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RegistryService {
    shared: Arc<Shared>,
}

impl RegistryService {
    /// Create a registry driving its connections on `runtime`.
    pub fn new(config: ClientConfig, runtime: Handle) -> Self {
        Self::with_collaborators(
            config,
            runtime,
            Arc::new(FilterRegistry::new()),
            Arc::new(NoopInvalidator),
        )
    }

    pub fn with_collaborators(
        config: ClientConfig,
        runtime: Handle,
        filters: Arc<FilterRegistry>,
        invalidator: Arc<dyn IdentityInvalidator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: SERVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                config,
                runtime,
                connections: Arc::new(AsyncConnections::default()),
                broker: Mutex::new(None),
                filters,
                invalidator,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.shared.filters
    }

    /// Number of entries in the async cache.
    pub fn async_cached_count(&self) -> usize {
        self.shared.connections.len()
    }

    fn async_hit(&self, identity: &DaemonIdentity) -> Option<Arc<Connection>> {
        let conn = self.shared.connections.lookup(identity)?;
        debug!(identity = %identity, conn = %conn.id(), "Async cache hit");
        self.shared.filters.export_on_connect(&conn);
        Some(conn)
    }

    /// Get the shared connection to `identity`, establishing it on a miss.
    ///
    /// A cache hit is returned even if `cancel` has fired. A connection that
    /// finishes establishing after `cancel` fired is still cached for later
    /// callers; this caller gets `Cancelled`.
    pub async fn connection_for_async(
        &self,
        identity: &DaemonIdentity,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Connection>> {
        if let Some(conn) = self.async_hit(identity) {
            return Ok(conn);
        }
        debug!(identity = %identity, "Async cache miss");

        let shared = &self.shared;
        let registry = Arc::downgrade(&shared.connections);
        let invalidator = shared.invalidator.clone();
        let conn = establish(identity, &shared.config, cancel, self.async_broker(), |conn| {
            teardown::attach(conn, Some(registry), invalidator)
        })
        .await?;

        let installed = self.adopt(identity, conn).await?;
        shared.filters.export_on_connect(&installed);
        complete_with_cancellable(Ok(installed), cancel)
    }

    /// Install a freshly established connection, closing it if another
    /// caller's connection won. A connection that died before it could be
    /// installed is reported as unreachable and its identity invalidated.
    async fn adopt(
        &self,
        identity: &DaemonIdentity,
        conn: Arc<Connection>,
    ) -> Result<Arc<Connection>> {
        let shared = &self.shared;
        let (installed, loser) = shared.connections.install(identity, conn);
        match loser {
            Some(loser) => {
                debug!(
                    identity = %identity,
                    conn = %loser.id(),
                    "Lost establishment race, closing redundant connection"
                );
                loser.close().await;
            }
            None if installed.is_closed() => {
                shared.connections.evict(identity, installed.id());
                if installed.claim_teardown() {
                    shared.invalidator.invalidate(identity);
                }
                return Err(VfsError::Unreachable(format!(
                    "Connection to {} closed during establishment",
                    identity
                )));
            }
            None => info!(identity = %identity, conn = %installed.id(), "Connected to daemon"),
        }
        Ok(installed)
    }

    /// Callback form of [`connection_for_async`](Self::connection_for_async).
    ///
    /// On a cache hit `callback` runs before this returns; otherwise it runs
    /// on a task spawned on the registry's runtime.
    pub fn get_for_async<F>(
        &self,
        identity: DaemonIdentity,
        cancel: Option<CancellationToken>,
        callback: F,
    ) where
        F: FnOnce(Result<Arc<Connection>>) + Send + 'static,
    {
        if let Some(conn) = self.async_hit(&identity) {
            callback(Ok(conn));
            return;
        }
        let service = self.clone();
        self.shared.runtime.spawn(async move {
            let result = service.connection_for_async(&identity, cancel.as_ref()).await;
            callback(result);
        });
    }

    /// The broker bus connection shared by async callers.
    pub async fn broker_connection(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Connection>> {
        with_cancel(cancel, self.async_broker()).await
    }

    async fn async_broker(&self) -> Result<Arc<Connection>> {
        let cached = self
            .shared
            .broker
            .lock()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let fresh = connect_broker(&self.shared.config).await?;
        let (broker, loser) = {
            let mut slot = self.shared.broker.lock();
            let existing = slot.as_ref().filter(|conn| !conn.is_closed()).cloned();
            match existing {
                Some(existing) => (existing, Some(fresh)),
                None => {
                    *slot = Some(fresh.clone());
                    (fresh, None)
                }
            }
        };
        match loser {
            Some(loser) => loser.close().await,
            None => debug!(conn = %broker.id(), "Broker bus connected"),
        }
        Ok(broker)
    }

    /// Get this thread's connection to `identity`, or to the broker bus when
    /// `identity` is `None`, blocking until it is established.
    ///
    /// A fired `cancel` yields [`VfsError::Cancelled`], even when the
    /// connection is cached. A cached connection found dead is evicted, its
    /// identity invalidated, and [`VfsError::Stale`] returned; call again to
    /// re-establish.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async execution context.
    pub fn connection_for_sync(
        &self,
        identity: Option<&DaemonIdentity>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Connection>> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(VfsError::Cancelled);
        }
        match identity {
            None => self
                .shared
                .runtime
                .block_on(with_cancel(cancel, self.thread_broker())),
            Some(identity) => self.thread_daemon(identity, cancel),
        }
    }

    fn thread_daemon(
        &self,
        identity: &DaemonIdentity,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Connection>> {
        if let Some(conn) = self.with_thread(|slot| slot.daemons.get(identity).cloned()) {
            if !conn.is_closed() {
                debug!(identity = %identity, conn = %conn.id(), "Thread cache hit");
                return Ok(conn);
            }
            let evicted = self.with_thread(|slot| slot.daemons.remove(identity));
            drop(evicted);
            info!(identity = %identity, conn = %conn.id(), "Thread connection is dead, invalidating");
            self.shared.invalidator.invalidate(identity);
            return Err(VfsError::Stale(identity.clone()));
        }

        debug!(identity = %identity, "Thread cache miss");
        let invalidator = self.shared.invalidator.clone();
        let conn = self.shared.runtime.block_on(establish(
            identity,
            &self.shared.config,
            cancel,
            self.thread_broker(),
            |conn| teardown::attach(conn, None, invalidator),
        ))?;

        self.shared.filters.export_on_connect(&conn);
        self.with_thread(|slot| slot.daemons.insert(identity.clone(), conn.clone()));
        Ok(conn)
    }

    async fn thread_broker(&self) -> Result<Arc<Connection>> {
        let cached = self.with_thread(|slot| slot.broker.clone());
        if let Some(conn) = cached.filter(|conn| !conn.is_closed()) {
            return Ok(conn);
        }
        let conn = connect_broker(&self.shared.config).await?;
        debug!(conn = %conn.id(), "Thread broker bus connected");
        let previous = self.with_thread(|slot| slot.broker.replace(conn.clone()));
        drop(previous);
        Ok(conn)
    }

    fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadConnections) -> R) -> R {
        THREAD_CONNECTIONS.with(|slots| f(slots.borrow_mut().entry(self.shared.id).or_default()))
    }

    /// Release every connection this thread cached for this registry.
    pub fn release_thread_connections(&self) {
        let released = THREAD_CONNECTIONS.with(|slots| slots.borrow_mut().remove(&self.shared.id));
        if let Some(released) = released {
            debug!(
                daemons = released.daemons.len(),
                "Released thread connections"
            );
        }
    }
}

impl std::fmt::Debug for RegistryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryService")
            .field("id", &self.shared.id)
            .field("broker_address", &self.shared.config.broker_address)
            .field("async_cached", &self.async_cached_count())
            .finish()
    }
}
