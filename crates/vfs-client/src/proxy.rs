//! Handle on the daemon control interface
//!
//! The broker and every daemon export the same control object at
//! [`DAEMON_PATH`]. On the broker bus the proxy carries a destination so the
//! broker can route `GetConnection` to the right daemon; on a peer-to-peer
//! connection it talks to the daemon directly.

use crate::connection::{Connection, MethodCall};
use crate::error::{Result, VfsError};
use crate::identity::DaemonIdentity;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vfs_protocol::{DAEMON_CANCEL, DAEMON_GET_CONNECTION, DAEMON_PATH};

/// Short-lived proxy; cheap to create per operation.
#[derive(Debug, Clone)]
pub struct DaemonProxy {
    conn: Arc<Connection>,
    destination: Option<DaemonIdentity>,
    timeout: Option<Duration>,
}

impl DaemonProxy {
    pub fn new(conn: Arc<Connection>, destination: Option<DaemonIdentity>) -> Self {
        Self {
            conn,
            destination,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn method(&self, method: &str, params: Value) -> MethodCall {
        let mut call = MethodCall::new(DAEMON_PATH, method).with_params(params);
        if let Some(destination) = &self.destination {
            call = call.with_destination(destination.as_str());
        }
        if let Some(timeout) = self.timeout {
            call = call.with_timeout(timeout);
        }
        call
    }

    /// Ask for a private peer-to-peer address of the destination daemon.
    pub async fn get_connection(&self) -> Result<String> {
        let reply = self.conn.call(self.method(DAEMON_GET_CONNECTION, json!({}))).await?;
        let address = reply
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| VfsError::Protocol("GetConnection reply carries no address".into()))?;
        debug!(
            destination = ?self.destination,
            address,
            "Broker allocated peer address"
        );
        Ok(address.to_string())
    }

    /// Ask the peer to cancel the call it received with `serial`.
    ///
    /// Fire-and-forget: only writing the request can fail.
    pub async fn cancel(&self, serial: u64) -> Result<()> {
        self.conn
            .call_no_reply(self.method(DAEMON_CANCEL, json!({ "serial": serial })))
            .await?;
        Ok(())
    }
}
