#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use vfs_client::{
    ClientConfig, Connection, ExportedHandle, Interface, Invocation, RpcError, DAEMON_PATH,
};
use vfs_protocol::{
    socket_address, DAEMON_CANCEL, DAEMON_GET_CONNECTION, METHOD_NOT_FOUND, SERVICE_UNKNOWN,
};

pub const TEST_OBJECT_PATH: &str = "/org/vfs/test/Object";

const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket directory plus a broker listening in it.
pub struct TestBus {
    pub temp_dir: TempDir,
    pub broker: MockBroker,
}

impl TestBus {
    pub async fn start() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let broker = MockBroker::start(temp_dir.path())?;
        Ok(Self { temp_dir, broker })
    }

    /// Start a daemon and make the broker route `identity` to it.
    pub fn daemon(&self, identity: &str) -> Result<MockDaemon> {
        let daemon = MockDaemon::start(self.temp_dir.path(), identity, false)?;
        self.broker.route(identity, &daemon.address);
        Ok(daemon)
    }

    /// Like [`daemon`](Self::daemon), but the daemon hangs up on every
    /// client right after answering its handshake.
    pub fn hangup_daemon(&self, identity: &str) -> Result<MockDaemon> {
        let daemon = MockDaemon::start(self.temp_dir.path(), identity, true)?;
        self.broker.route(identity, &daemon.address);
        Ok(daemon)
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::default().with_broker_address(self.broker.address.clone())
    }
}

struct BrokerControl {
    routes: Arc<Mutex<HashMap<String, String>>>,
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl Interface for BrokerControl {
    fn interface_name(&self) -> &str {
        vfs_protocol::DAEMON_INTERFACE
    }

    async fn handle(&self, invocation: Invocation) -> std::result::Result<Value, RpcError> {
        if invocation.method != DAEMON_GET_CONNECTION {
            return Err(RpcError::new(METHOD_NOT_FOUND, invocation.method));
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let destination = invocation.destination.unwrap_or_default();
        match self.routes.lock().get(&destination) {
            Some(address) => Ok(json!({ "address": address })),
            None => Err(RpcError::new(
                SERVICE_UNKNOWN,
                format!("The name {} was not provided by any service", destination),
            )),
        }
    }
}

pub struct MockBroker {
    pub address: String,
    routes: Arc<Mutex<HashMap<String, String>>>,
    lookups: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    _task: JoinHandle<()>,
}

impl MockBroker {
    fn start(dir: &Path) -> Result<Self> {
        let socket_path = dir.join("broker.sock");
        let listener = UnixListener::bind(&socket_path)?;
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let lookups = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = {
            let routes = routes.clone();
            let lookups = lookups.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                let mut peers: Vec<(Arc<Connection>, ExportedHandle)> = Vec::new();
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let conn = Connection::accept(stream, PEER_TIMEOUT);
                    let control = Arc::new(BrokerControl {
                        routes: routes.clone(),
                        lookups: lookups.clone(),
                    });
                    if let Ok(handle) = conn.export(DAEMON_PATH, control) {
                        peers.push((conn, handle));
                    }
                }
            })
        };

        Ok(Self {
            address: socket_address(&socket_path),
            routes,
            lookups,
            accepted,
            _task: task,
        })
    }

    pub fn route(&self, identity: &str, address: &str) {
        self.routes
            .lock()
            .insert(identity.to_string(), address.to_string());
    }

    /// Number of `GetConnection` calls served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Control object of a mock daemon: records `Cancel` serials.
struct DaemonControl {
    cancels: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Interface for DaemonControl {
    fn interface_name(&self) -> &str {
        vfs_protocol::DAEMON_INTERFACE
    }

    async fn handle(&self, invocation: Invocation) -> std::result::Result<Value, RpcError> {
        if invocation.method != DAEMON_CANCEL {
            return Err(RpcError::new(METHOD_NOT_FOUND, invocation.method));
        }
        if let Some(serial) = invocation.params.get("serial").and_then(Value::as_u64) {
            self.cancels.lock().push(serial);
        }
        Ok(Value::Null)
    }
}

/// Backend object: `Echo` returns its params, `Slow` sleeps first.
pub struct TestObject;

#[async_trait]
impl Interface for TestObject {
    fn interface_name(&self) -> &str {
        "org.vfs.test.Object"
    }

    async fn handle(&self, invocation: Invocation) -> std::result::Result<Value, RpcError> {
        match invocation.method.as_str() {
            "Echo" => Ok(invocation.params),
            "Slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(invocation.params)
            }
            other => Err(RpcError::new(METHOD_NOT_FOUND, other.to_string())),
        }
    }
}

struct DaemonPeer {
    conn: Arc<Connection>,
    _exports: Vec<ExportedHandle>,
}

pub struct MockDaemon {
    pub address: String,
    pub socket_path: PathBuf,
    peers: Arc<Mutex<Vec<DaemonPeer>>>,
    cancels: Arc<Mutex<Vec<u64>>>,
    accepted: Arc<AtomicUsize>,
    _task: JoinHandle<()>,
}

impl MockDaemon {
    fn start(dir: &Path, name: &str, hang_up: bool) -> Result<Self> {
        let socket_path = dir.join(format!("{}.sock", name.replace([':', '.'], "_")));
        let listener = UnixListener::bind(&socket_path)?;
        let peers = Arc::new(Mutex::new(Vec::new()));
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = {
            let peers = peers.clone();
            let cancels = cancels.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let conn = Connection::accept(stream, PEER_TIMEOUT);
                    let control = Arc::new(DaemonControl {
                        cancels: cancels.clone(),
                    });
                    let exports = [
                        conn.export(DAEMON_PATH, control),
                        conn.export(TEST_OBJECT_PATH, Arc::new(TestObject)),
                    ]
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .collect();
                    if hang_up {
                        tokio::spawn(hang_up_after_handshake(conn.clone()));
                    }
                    peers.lock().push(DaemonPeer {
                        conn,
                        _exports: exports,
                    });
                }
            })
        };

        Ok(Self {
            address: socket_address(&socket_path),
            socket_path,
            peers,
            cancels,
            accepted,
            _task: task,
        })
    }

    /// Connections accepted so far, dead or alive.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Accepted connections still open.
    pub fn live_peers(&self) -> usize {
        self.peers
            .lock()
            .iter()
            .filter(|peer| !peer.conn.is_closed())
            .count()
    }

    /// The daemon side of every open connection.
    pub fn peer_connections(&self) -> Vec<Arc<Connection>> {
        self.peers
            .lock()
            .iter()
            .filter(|peer| !peer.conn.is_closed())
            .map(|peer| peer.conn.clone())
            .collect()
    }

    pub fn cancels(&self) -> Vec<u64> {
        self.cancels.lock().clone()
    }

    /// Close every accepted connection from the daemon side.
    pub async fn disconnect_all(&self) {
        let peers: Vec<DaemonPeer> = std::mem::take(&mut *self.peers.lock());
        for peer in &peers {
            peer.conn.close().await;
        }
    }
}

async fn hang_up_after_handshake(conn: Arc<Connection>) {
    if wait_until(|| conn.guid().is_some()).await {
        // Let the Hello reply reach the client first
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    conn.close().await;
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Blocking variant of [`wait_until`] for plain threads.
pub fn wait_until_blocking(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
