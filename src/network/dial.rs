use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use super::agent::{drive_agent, reject, Admission, ConnSet};
use super::{Conn, NewAgent};
use crate::{AppResult, Shutdown};

/// Opens one transport connection to the configured peer.
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    type Conn: Conn;

    fn peer(&self) -> &str;

    async fn connect(&self) -> AppResult<Self::Conn>;
}

enum DialState<C> {
    Dialing,
    Connected(Arc<C>),
    Closed,
}

/// One dial worker of a client: dials until connected, runs the agent, and
/// optionally starts over once the connection is gone.
pub(crate) struct DialWorker<K: Connector> {
    pub(crate) connector: Arc<K>,
    pub(crate) conns: Arc<ConnSet>,
    pub(crate) new_agent: NewAgent<K::Conn>,
    pub(crate) connect_interval: Duration,
    pub(crate) auto_reconnect: bool,
    pub(crate) shutdown_complete_tx: mpsc::Sender<()>,
}

impl<K: Connector> DialWorker<K> {
    pub(crate) async fn run(self, mut shutdown: Shutdown) {
        let mut state = DialState::Dialing;
        loop {
            state = match state {
                DialState::Dialing => match self.dial(&mut shutdown).await {
                    Some(conn) => DialState::Connected(conn),
                    None => break,
                },
                DialState::Connected(conn) => {
                    let agent = (self.new_agent)(conn.clone());
                    drive_agent(conn, agent, self.conns.clone(), self.shutdown_complete_tx.clone()).await;
                    DialState::Closed
                }
                DialState::Closed => {
                    if self.auto_reconnect && !self.conns.is_closing() && !shutdown.is_shutdown() {
                        info!("reconnecting to {}", self.connector.peer());
                        DialState::Dialing
                    } else {
                        break;
                    }
                }
            };
        }
        debug!("dial worker for {} exited", self.connector.peer());
    }

    async fn dial(&self, shutdown: &mut Shutdown) -> Option<Arc<K::Conn>> {
        loop {
            if self.conns.is_closing() {
                return None;
            }

            let res = tokio::select! {
                _ = shutdown.recv() => return None,
                res = self.connector.connect() => res,
            };
            match res {
                Ok(conn) => match self.conns.admit(usize::MAX, || Ok(Arc::new(conn))) {
                    Admission::Admitted(conn) => return Some(conn),
                    other => {
                        reject(other, self.connector.peer());
                        if self.conns.is_closing() {
                            return None;
                        }
                    }
                },
                Err(err) => warn!("connect to {} error: {}", self.connector.peer(), err),
            }

            tokio::select! {
                _ = shutdown.recv() => return None,
                _ = time::sleep(self.connect_interval) => {}
            }
        }
    }
}
