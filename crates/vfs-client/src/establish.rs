//! Connection establishment
//!
//! Turning a daemon identity into a peer-to-peer connection takes three
//! round-trips: get hold of the broker bus, ask the broker for the daemon's
//! private address, then connect to that address and authenticate. Each
//! stage is raced against the caller's cancellation token. Nothing is
//! retried here.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Result, VfsError};
use crate::identity::DaemonIdentity;
use crate::proxy::DaemonProxy;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishStage {
    FetchingBroker,
    RequestingAddress,
    Connecting,
    Done,
    Failed,
}

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn with_cancel<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(VfsError::Cancelled),
                result = fut => result,
            }
        }
    }
}

/// Connect to the broker bus at the configured address.
pub(crate) async fn connect_broker(config: &ClientConfig) -> Result<Arc<Connection>> {
    Connection::connect(&config.broker_address, config)
        .await
        .map_err(|e| VfsError::Unreachable(format!("Couldn't connect to the broker bus: {}", e)))
}

struct Establishment<'a> {
    identity: &'a DaemonIdentity,
    cancel: Option<&'a CancellationToken>,
    stage: EstablishStage,
}

impl Establishment<'_> {
    fn enter(&mut self, next: EstablishStage) {
        debug!(
            identity = %self.identity,
            from = ?self.stage,
            to = ?next,
            "Establishment stage"
        );
        self.stage = next;
    }

    async fn drive<B>(
        &mut self,
        config: &ClientConfig,
        fetch_broker: B,
        on_connected: impl FnOnce(&Arc<Connection>),
    ) -> Result<Arc<Connection>>
    where
        B: Future<Output = Result<Arc<Connection>>>,
    {
        let broker = with_cancel(self.cancel, fetch_broker).await?;

        self.enter(EstablishStage::RequestingAddress);
        let proxy = DaemonProxy::new(broker, Some(self.identity.clone()))
            .with_timeout(config.call_timeout());
        let address = with_cancel(self.cancel, proxy.get_connection()).await?;

        self.enter(EstablishStage::Connecting);
        let conn = with_cancel(self.cancel, Connection::connect(&address, config))
            .await
            .map_err(|e| match e {
                VfsError::Cancelled => VfsError::Cancelled,
                e => VfsError::Unreachable(format!(
                    "Error while getting peer-to-peer connection: {}",
                    e
                )),
            })?;

        on_connected(&conn);
        Ok(conn)
    }
}

/// Run the three stages for `identity`.
///
/// `fetch_broker` yields the broker bus connection; `on_connected` runs on
/// the fresh connection before it is handed back, and is where the teardown
/// hook gets attached.
pub(crate) async fn establish<B>(
    identity: &DaemonIdentity,
    config: &ClientConfig,
    cancel: Option<&CancellationToken>,
    fetch_broker: B,
    on_connected: impl FnOnce(&Arc<Connection>),
) -> Result<Arc<Connection>>
where
    B: Future<Output = Result<Arc<Connection>>>,
{
    let mut establishment = Establishment {
        identity,
        cancel,
        stage: EstablishStage::FetchingBroker,
    };
    debug!(identity = %identity, "Establishing peer connection");

    match establishment.drive(config, fetch_broker, on_connected).await {
        Ok(conn) => {
            establishment.enter(EstablishStage::Done);
            Ok(conn)
        }
        Err(e) => {
            debug!(identity = %identity, stage = ?establishment.stage, "Establishment failed: {}", e);
            establishment.enter(EstablishStage::Failed);
            Err(e)
        }
    }
}
