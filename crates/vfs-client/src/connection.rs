//! Multiplexed peer connection
//!
//! A [`Connection`] is one bidirectional channel to a peer process, framed as
//! newline-delimited JSON. Outbound calls are correlated with their replies
//! by the outbound serial, so any number of callers can share a connection.
//! Incoming calls are dispatched to interfaces exported on the connection by
//! object path.
//!
//! The same type is used on both ends: the client role connects and performs
//! the `Hello` handshake, the server role answers it.

use crate::config::ClientConfig;
use crate::error::{Result, VfsError};
use crate::identity::DaemonIdentity;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vfs_protocol::{
    parse_address, Message, Request, Response, RpcError, AUTH_FAILED, CONNECTION_HELLO,
    METHOD_NOT_FOUND, UNKNOWN_OBJECT,
};

/// Counter for generating unique connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected out; sends `Hello`.
    Client,
    /// Accepted; answers `Hello`.
    Server,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end.
    PeerVanished,
    /// Reading or writing failed.
    Transport(String),
    /// [`Connection::close`] was called on this side.
    Local,
}

pub type CloseHook = Box<dyn FnOnce(&Connection, &CloseReason) + Send + 'static>;

/// An incoming call delivered to an exported [`Interface`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub path: String,
    pub method: String,
    pub destination: Option<String>,
    pub params: Value,
    /// Serial the caller assigned to this call, if it expects a reply.
    pub serial: Option<u64>,
}

/// A remotely callable object.
#[async_trait]
pub trait Interface: Send + Sync {
    fn interface_name(&self) -> &str;

    async fn handle(&self, invocation: Invocation) -> std::result::Result<Value, RpcError>;
}

/// An outbound method call.
#[derive(Debug, Clone)]
pub struct MethodCall {
    path: Option<String>,
    method: String,
    destination: Option<String>,
    params: Value,
    timeout: Option<Duration>,
}

impl MethodCall {
    /// Call `method` on the object exported at `path`.
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            method: method.into(),
            destination: None,
            params: Value::Null,
            timeout: None,
        }
    }

    /// Connection-level call, not addressed to any object.
    pub fn connection_level(method: impl Into<String>) -> Self {
        Self {
            path: None,
            method: method.into(),
            destination: None,
            params: Value::Null,
            timeout: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn into_request(self, serial: u64) -> Request {
        let mut request = Request::new(serial, self.method, self.params);
        request.path = self.path;
        request.destination = self.destination;
        request
    }
}

pub struct Connection {
    id: ConnectionId,
    role: Role,
    guid: OnceLock<String>,
    identity: OnceLock<DaemonIdentity>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_serial: AtomicU64,
    last_serials: Mutex<HashMap<ThreadId, u64>>,
    torn_down: AtomicBool,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    exports: RwLock<HashMap<String, Arc<dyn Interface>>>,
    call_timeout: Duration,
    runtime: Handle,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an already connected stream. Must be called within a tokio runtime.
    pub fn new(stream: UnixStream, role: Role, call_timeout: Duration) -> Arc<Self> {
        let (read, write) = stream.into_split();
        let runtime = Handle::current();

        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            role,
            guid: OnceLock::new(),
            identity: OnceLock::new(),
            writer: tokio::sync::Mutex::new(write),
            pending: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            last_serials: Mutex::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            close_hooks: Mutex::new(Vec::new()),
            exports: RwLock::new(HashMap::new()),
            call_timeout,
            runtime: runtime.clone(),
            reader: Mutex::new(None),
        });

        let task = runtime.spawn(read_loop(Arc::downgrade(&conn), BufReader::new(read)));
        *conn.reader.lock() = Some(task);

        debug!(conn = %conn.id, role = ?role, "Connection opened");
        conn
    }

    /// Wrap a stream accepted from a listener.
    pub fn accept(stream: UnixStream, call_timeout: Duration) -> Arc<Self> {
        Self::new(stream, Role::Server, call_timeout)
    }

    /// Open a peer-to-peer connection to `address` and authenticate.
    pub async fn connect(address: &str, config: &ClientConfig) -> Result<Arc<Self>> {
        let path = parse_address(address)
            .ok_or_else(|| VfsError::Unreachable(format!("Unsupported address: {}", address)))?;
        let connect_timeout = config.connect_timeout();
        let call_timeout = config.call_timeout();

        tokio::time::timeout(connect_timeout, async move {
            let stream = UnixStream::connect(&path).await?;
            let conn = Connection::new(stream, Role::Client, call_timeout);
            conn.handshake().await?;
            Ok::<_, VfsError>(conn)
        })
        .await
        .map_err(|_| VfsError::Timeout(connect_timeout))?
    }

    async fn handshake(self: &Arc<Self>) -> Result<()> {
        let params = serde_json::json!({
            "pid": std::process::id(),
            "uid": current_uid(),
        });
        let reply = self
            .call(MethodCall::connection_level(CONNECTION_HELLO).with_params(params))
            .await?;
        let guid = reply
            .get("guid")
            .and_then(Value::as_str)
            .ok_or_else(|| VfsError::Protocol("Hello reply carries no guid".into()))?;
        let _ = self.guid.set(guid.to_string());
        debug!(conn = %self.id, guid, "Handshake complete");
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Server guid, once the handshake has run.
    pub fn guid(&self) -> Option<&str> {
        self.guid.get().map(String::as_str)
    }

    /// The daemon this connection is cached for, if any.
    pub fn identity(&self) -> Option<&DaemonIdentity> {
        self.identity.get()
    }

    /// Bind the connection to a daemon identity. Only the first bind sticks.
    pub(crate) fn bind_identity(&self, identity: DaemonIdentity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Serial of the most recent message sent from the calling thread, 0
    /// before the first send.
    pub fn last_serial(&self) -> u64 {
        self.last_serials
            .lock()
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or(0)
    }

    /// True for the first caller only; whoever claims a closed connection
    /// reports its identity as gone.
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    /// Register a hook to run once when the connection closes.
    ///
    /// If the connection is already closed the hook runs immediately.
    pub fn on_close(&self, hook: impl FnOnce(&Connection, &CloseReason) + Send + 'static) {
        let reason = {
            let mut hooks = self.close_hooks.lock();
            match self.close_reason.lock().clone() {
                Some(reason) => reason,
                None => {
                    hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        hook(self, &reason);
    }

    /// Send a call and return a handle to await its reply.
    ///
    /// When this returns the request has been written, so
    /// [`PendingReply::serial`] (and, on the sending thread,
    /// [`Connection::last_serial`]) identify it.
    pub async fn send(self: &Arc<Self>, call: MethodCall) -> Result<PendingReply> {
        let timeout = call.timeout.unwrap_or(self.call_timeout);
        let (serial, rx) = self.write_call(call, true).await?;
        let rx = rx.ok_or_else(|| VfsError::Protocol("no reply slot".into()))?;
        Ok(PendingReply {
            serial,
            rx,
            timeout,
            conn: Arc::downgrade(self),
        })
    }

    pub async fn call(self: &Arc<Self>, call: MethodCall) -> Result<Value> {
        self.send(call).await?.wait().await
    }

    /// Send a call without waiting for, or keeping, its reply.
    pub async fn call_no_reply(&self, call: MethodCall) -> Result<u64> {
        let (serial, _) = self.write_call(call, false).await?;
        Ok(serial)
    }

    async fn write_call(
        &self,
        call: MethodCall,
        expect_reply: bool,
    ) -> Result<(u64, Option<oneshot::Receiver<Response>>)> {
        if self.is_closed() {
            return Err(VfsError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&call.into_request(serial))?;
        line.push('\n');

        let rx = if expect_reply {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(serial, tx);
            // Closed between the check above and the insert: nobody will drain it
            if self.is_closed() {
                self.pending.lock().remove(&serial);
                return Err(VfsError::Closed);
            }
            Some(rx)
        } else {
            None
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            drop(writer);
            self.pending.lock().remove(&serial);
            self.mark_closed(CloseReason::Transport(e.to_string()));
            return Err(VfsError::Io(e));
        }
        self.last_serials
            .lock()
            .insert(std::thread::current().id(), serial);
        Ok((serial, rx))
    }

    async fn write_response(&self, response: &Response) {
        let mut line = match serde_json::to_string(response) {
            Ok(line) => line,
            Err(e) => {
                warn!(conn = %self.id, "Failed to encode reply: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = write_line(&mut writer, &line).await {
            drop(writer);
            debug!(conn = %self.id, "Failed to write reply: {}", e);
            self.mark_closed(CloseReason::Transport(e.to_string()));
        }
    }

    /// Make `interface` callable by the peer at `path`.
    ///
    /// The export lasts until the returned handle is dropped.
    pub fn export(
        self: &Arc<Self>,
        path: &str,
        interface: Arc<dyn Interface>,
    ) -> Result<ExportedHandle> {
        let mut exports = self.exports.write();
        if exports.contains_key(path) {
            return Err(VfsError::AlreadyExported(path.to_string()));
        }
        exports.insert(path.to_string(), interface.clone());
        debug!(conn = %self.id, path, interface = interface.interface_name(), "Exported");

        Ok(ExportedHandle {
            conn: Arc::downgrade(self),
            conn_id: self.id,
            path: path.to_string(),
            interface,
        })
    }

    pub fn is_exported(&self, path: &str) -> bool {
        self.exports.read().contains_key(path)
    }

    pub fn exported_paths(&self) -> Vec<String> {
        self.exports.read().keys().cloned().collect()
    }

    fn unexport_instance(&self, path: &str, interface: &Arc<dyn Interface>) -> bool {
        let mut exports = self.exports.write();
        match exports.get(path) {
            Some(current) if same_instance(current, interface) => {
                exports.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Half-close the channel so the peer sees end-of-stream, fail pending
    /// calls and fire close hooks.
    pub async fn close(&self) {
        if !self.is_closed() {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(conn = %self.id, "Shutdown failed: {}", e);
            }
        }
        self.mark_closed(CloseReason::Local);
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }

    fn mark_closed(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        self.closed.cancel();

        // Dropping the senders fails every waiter with Closed
        let pending: Vec<_> = self.pending.lock().drain().collect();
        drop(pending);

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        debug!(conn = %self.id, reason = ?reason, hooks = hooks.len(), "Connection closed");
        for hook in hooks {
            hook(self, &reason);
        }
    }

    fn complete(&self, response: Response) {
        let Some(serial) = response.serial() else {
            debug!(conn = %self.id, "Reply without serial ignored");
            return;
        };
        let waiter = self.pending.lock().remove(&serial);
        match waiter {
            // Receiver may have been dropped
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(conn = %self.id, serial, "Reply for unknown serial ignored"),
        }
    }

    fn dispatch(self: &Arc<Self>, request: Request) {
        let conn = self.clone();
        self.runtime.spawn(async move {
            let id = request.id.clone();
            let response = conn.handle_request(request).await;
            if id.is_some() {
                conn.write_response(&response).await;
            }
        });
    }

    async fn handle_request(&self, request: Request) -> Response {
        let Some(path) = request.path.clone() else {
            if request.method == CONNECTION_HELLO {
                return self.answer_hello(&request);
            }
            return Response::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Unknown connection method: {}", request.method),
            );
        };

        let interface = self.exports.read().get(&path).cloned();
        let Some(interface) = interface else {
            debug!(conn = %self.id, path, method = %request.method, "Call to unexported path");
            return Response::error(
                request.id,
                UNKNOWN_OBJECT,
                format!("No such object path '{}'", path),
            );
        };

        let id = request.id.clone();
        let invocation = Invocation {
            serial: request.serial(),
            path,
            method: request.method,
            destination: request.destination,
            params: request.params,
        };
        match interface.handle(invocation).await {
            Ok(result) => Response::success(id, result),
            Err(err) => Response::from_error(id, err),
        }
    }

    fn answer_hello(&self, request: &Request) -> Response {
        if self.role != Role::Server {
            return Response::error(
                request.id.clone(),
                METHOD_NOT_FOUND,
                "Hello is only answered by the accepting side",
            );
        }
        let uid = request.params.get("uid").and_then(Value::as_u64);
        if uid != Some(u64::from(current_uid())) {
            warn!(conn = %self.id, ?uid, "Rejecting handshake from foreign uid");
            return Response::error(request.id.clone(), AUTH_FAILED, "Peer uid does not match");
        }
        let guid = self
            .guid
            .get_or_init(|| uuid::Uuid::new_v4().simple().to_string());
        Response::success(request.id.clone(), serde_json::json!({ "guid": guid }))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
        self.closed.cancel();
        debug!(conn = %self.id, "Connection released");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("identity", &self.identity.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A sent call awaiting its reply.
pub struct PendingReply {
    serial: u64,
    rx: oneshot::Receiver<Response>,
    timeout: Duration,
    conn: Weak<Connection>,
}

impl PendingReply {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub async fn wait(mut self) -> Result<Value> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Err(_) => Err(VfsError::Timeout(self.timeout)),
            Ok(Err(_)) => Err(VfsError::Closed),
            Ok(Ok(response)) => match response.error {
                Some(err) => Err(err.into()),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.pending.lock().remove(&self.serial);
        }
    }
}

/// Keeps an interface exported on a connection. Dropping it unexports.
pub struct ExportedHandle {
    conn: Weak<Connection>,
    conn_id: ConnectionId,
    path: String,
    interface: Arc<dyn Interface>,
}

impl ExportedHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn interface(&self) -> &Arc<dyn Interface> {
        &self.interface
    }

    /// The connection is still held somewhere and open.
    pub fn is_live(&self) -> bool {
        self.conn.upgrade().is_some_and(|conn| !conn.is_closed())
    }

    pub fn unexport(self) {}
}

impl Drop for ExportedHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            if conn.unexport_instance(&self.path, &self.interface) {
                debug!(conn = %self.conn_id, path = %self.path, "Unexported");
            }
        }
    }
}

impl std::fmt::Debug for ExportedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedHandle")
            .field("conn", &self.conn_id)
            .field("path", &self.path)
            .field("interface", &self.interface.interface_name())
            .finish()
    }
}

fn same_instance(a: &Arc<dyn Interface>, b: &Arc<dyn Interface>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn read_loop(weak: Weak<Connection>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();
    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break CloseReason::PeerVanished,
            Ok(_) => {}
            Err(e) => break CloseReason::Transport(e.to_string()),
        }
        let Some(conn) = weak.upgrade() else {
            return;
        };
        if line.trim().is_empty() {
            continue;
        }
        match Message::parse(&line) {
            Ok(Message::Response(response)) => conn.complete(response),
            Ok(Message::Request(request)) => conn.dispatch(request),
            Err(e) => warn!(conn = %conn.id, "Dropping unparseable message: {}", e),
        }
    };

    if let Some(conn) = weak.upgrade() {
        conn.mark_closed(reason);
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() }
}
