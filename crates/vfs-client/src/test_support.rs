use crate::connection::{Connection, Interface, Invocation, Role};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use vfs_protocol::{RpcError, DAEMON_CANCEL, DAEMON_INTERFACE, INTERNAL_ERROR, METHOD_NOT_FOUND};

pub(crate) const ECHO_PATH: &str = "/org/vfs/test/Echo";

/// Connected client/server pair over a socketpair, no handshake.
pub(crate) fn connection_pair() -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = UnixStream::pair().unwrap();
    (
        Connection::new(a, Role::Client, Duration::from_secs(5)),
        Connection::new(b, Role::Server, Duration::from_secs(5)),
    )
}

pub(crate) struct Echo;

#[async_trait]
impl Interface for Echo {
    fn interface_name(&self) -> &str {
        "org.vfs.test.Echo"
    }

    async fn handle(&self, invocation: Invocation) -> Result<Value, RpcError> {
        match invocation.method.as_str() {
            "Echo" => Ok(invocation.params),
            "Fail" => Err(RpcError::remote(
                INTERNAL_ERROR,
                "org.vfs.Error.Failed",
                "boom",
            )),
            "Slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(Value::Null)
            }
            other => Err(RpcError::new(METHOD_NOT_FOUND, other.to_string())),
        }
    }
}

/// Daemon control object that records every `Cancel` it receives.
#[derive(Default)]
pub(crate) struct CancelRecorder {
    serials: Mutex<Vec<u64>>,
}

impl CancelRecorder {
    pub(crate) fn serials(&self) -> Vec<u64> {
        self.serials.lock().clone()
    }
}

#[async_trait]
impl Interface for CancelRecorder {
    fn interface_name(&self) -> &str {
        DAEMON_INTERFACE
    }

    async fn handle(&self, invocation: Invocation) -> Result<Value, RpcError> {
        if invocation.method != DAEMON_CANCEL {
            return Err(RpcError::new(METHOD_NOT_FOUND, invocation.method));
        }
        if let Some(serial) = invocation.params.get("serial").and_then(Value::as_u64) {
            self.serials.lock().push(serial);
        }
        Ok(Value::Null)
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
