use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::Conn;
use crate::{AppError, AppResult};

/// The consumer a connection manager builds for every accepted or dialed connection.
///
/// `run` is the read loop; when it returns the manager closes the connection,
/// forgets it and then calls `on_close`, which may block the manager's cleanup.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    async fn run(&self);

    async fn on_close(&self);
}

/// Factory invoked once per admitted connection.
pub type NewAgent<C> = Arc<dyn Fn(Arc<C>) -> Arc<dyn Agent> + Send + Sync>;

pub(crate) enum Admission<C> {
    Admitted(Arc<C>),
    Full,
    Closing,
    Failed(AppError),
}

/// The live connections of one manager.
///
/// `None` marks the closing state, after which nothing is admitted.
pub(crate) struct ConnSet {
    conns: Mutex<Option<HashMap<u64, Arc<dyn Conn>>>>,
}

impl ConnSet {
    pub(crate) fn new() -> ConnSet {
        ConnSet {
            conns: Mutex::new(Some(HashMap::new())),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.lock().as_ref().map_or(0, HashMap::len)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.conns.lock().is_none()
    }

    /// Builds and records a connection if the set is open and below `max_conn_num`.
    ///
    /// `make` runs under the lock so the size check and the insert are atomic.
    pub(crate) fn admit<C, F>(&self, max_conn_num: usize, make: F) -> Admission<C>
    where
        C: Conn,
        F: FnOnce() -> AppResult<Arc<C>>,
    {
        let mut guard = self.conns.lock();
        let Some(conns) = guard.as_mut() else {
            return Admission::Closing;
        };
        if conns.len() >= max_conn_num {
            return Admission::Full;
        }
        match make() {
            Ok(conn) => {
                conns.insert(conn.id(), conn.clone());
                Admission::Admitted(conn)
            }
            Err(err) => Admission::Failed(err),
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        if let Some(conns) = self.conns.lock().as_mut() {
            conns.remove(&id);
        }
    }

    /// Enters the closing state and closes every live connection.
    pub(crate) fn close_all(&self) {
        let conns = self.conns.lock().take();
        for conn in conns.into_iter().flat_map(HashMap::into_values) {
            conn.close();
        }
    }
}

/// Runs `agent` to completion, then tears its connection down.
///
/// `_shutdown_complete` is held for the lifetime of the task so the manager can
/// wait for every connection task to finish.
pub(crate) async fn drive_agent(
    conn: Arc<dyn Conn>,
    agent: Arc<dyn Agent>,
    conns: Arc<ConnSet>,
    _shutdown_complete: mpsc::Sender<()>,
) {
    agent.run().await;
    conn.close();
    conns.remove(conn.id());
    agent.on_close().await;
    trace!("connection {} with {} released", conn.id(), conn.remote_addr());
}

pub(crate) fn reject<C>(admission: Admission<C>, remote: impl std::fmt::Display) {
    match admission {
        Admission::Full => warn!("too many connections, rejected {}", remote),
        Admission::Closing => trace!("manager closing, dropped connection from {}", remote),
        Admission::Failed(err) => debug!("failed to set up connection with {}: {}", remote, err),
        Admission::Admitted(_) => {}
    }
}
