//! Filter registry
//!
//! Feature modules register interfaces ("filters") that must be available on
//! every daemon connection, for example a monitor callback object. Each
//! registration is keyed by a unique object path and exported lazily, once
//! per connection, by [`FilterRegistry::export_on_connect`].
//!
//! Exports are strictly additive: a connection that already carries a
//! filter's export keeps it, so replies a daemon is about to deliver to it
//! are never lost to a re-export.

use crate::connection::{Connection, ConnectionId, ExportedHandle, Interface};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opaque per-registration data handed back to the factory.
pub type FilterContext = Arc<dyn Any + Send + Sync>;

/// Builds the interface to export for one `(connection, path)` pair.
pub type FilterFactory =
    Arc<dyn Fn(&Arc<Connection>, &str, &FilterContext) -> Arc<dyn Interface> + Send + Sync>;

/// Path, record generation, factory and context of an export to build.
type MissingExport = (String, u64, FilterFactory, FilterContext);

struct FilterRecord {
    generation: u64,
    factory: FilterFactory,
    context: FilterContext,
    exported: HashMap<ConnectionId, ExportedHandle>,
}

#[derive(Default)]
pub struct FilterRegistry {
    records: Mutex<HashMap<String, FilterRecord>>,
    generations: AtomicU64,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter at `path`.
    ///
    /// An existing registration at the same path is replaced and destroyed,
    /// which unexports it from every connection. Returns whether a
    /// registration was replaced.
    pub fn register<F>(&self, path: &str, factory: F, context: FilterContext) -> bool
    where
        F: Fn(&Arc<Connection>, &str, &FilterContext) -> Arc<dyn Interface>
            + Send
            + Sync
            + 'static,
    {
        let record = FilterRecord {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            factory: Arc::new(factory),
            context,
            exported: HashMap::new(),
        };
        let replaced = self.records.lock().insert(path.to_string(), record);
        match replaced {
            Some(old) => {
                debug!(path, exports = old.exported.len(), "Filter registration replaced");
                drop(old);
                true
            }
            None => {
                debug!(path, "Filter registered");
                false
            }
        }
    }

    /// Remove the filter at `path`, unexporting it everywhere.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.records.lock().remove(path);
        match removed {
            Some(record) => {
                debug!(path, exports = record.exported.len(), "Filter unregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.records.lock().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    /// Number of connections the filter at `path` is currently exported on.
    pub fn exported_count(&self, path: &str) -> usize {
        self.records
            .lock()
            .get(path)
            .map_or(0, |record| record.exported.len())
    }

    /// Export every registered filter not yet exported on `conn`.
    ///
    /// Safe to call any number of times per connection. Factories run
    /// without the registry lock held, so they may call back into it; an
    /// interface built for a registration that was replaced or removed in
    /// the meantime is discarded. Returns how many exports were made.
    pub fn export_on_connect(&self, conn: &Arc<Connection>) -> usize {
        let (missing, released) = self.prune_and_collect(conn);
        if missing.is_empty() {
            drop(released);
            return 0;
        }

        let built: Vec<_> = missing
            .into_iter()
            .map(|(path, generation, factory, context)| {
                let interface = factory(conn, &path, &context);
                (path, generation, interface)
            })
            .collect();

        let mut count = 0;
        {
            let mut records = self.records.lock();
            for (path, generation, interface) in built {
                let Some(record) = records
                    .get_mut(&path)
                    .filter(|record| record.generation == generation)
                else {
                    debug!(conn = %conn.id(), path = %path, "Filter changed while exporting, skipped");
                    continue;
                };
                if record.exported.contains_key(&conn.id()) {
                    continue;
                }
                match conn.export(&path, interface) {
                    Ok(handle) => {
                        debug!(conn = %conn.id(), path = %path, "Filter exported");
                        record.exported.insert(conn.id(), handle);
                        count += 1;
                    }
                    Err(e) => warn!(conn = %conn.id(), path = %path, "Failed to export filter: {}", e),
                }
            }
        }
        // Unexport outside the filter lock
        drop(released);
        count
    }

    /// Drop handles on dead connections and list the registrations `conn`
    /// still lacks.
    fn prune_and_collect(&self, conn: &Arc<Connection>) -> (Vec<MissingExport>, Vec<ExportedHandle>) {
        let mut missing = Vec::new();
        let mut released = Vec::new();
        let mut records = self.records.lock();
        for (path, record) in records.iter_mut() {
            let dead: Vec<ConnectionId> = record
                .exported
                .iter()
                .filter(|(_, handle)| !handle.is_live())
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                released.extend(record.exported.remove(&id));
            }

            if !record.exported.contains_key(&conn.id()) {
                missing.push((
                    path.clone(),
                    record.generation,
                    record.factory.clone(),
                    record.context.clone(),
                ));
            }
        }
        (missing, released)
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}
