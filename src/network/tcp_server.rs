// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::accept::accept;
use super::agent::{drive_agent, reject, Admission, ConnSet};
use super::{Agent, FrameCodec, NewAgent, TcpConn};
use crate::service::TcpServerConfig;
use crate::{AppError, AppResult, Shutdown};

/// Accepts tcp connections and runs one agent per connection.
pub struct TcpServer {
    config: TcpServerConfig,
    new_agent: NewAgent<TcpConn>,
    conns: Arc<ConnSet>,
    local_addr: Option<SocketAddr>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    accept_handle: Option<JoinHandle<()>>,
}

struct Acceptor {
    listener: TcpListener,
    conns: Arc<ConnSet>,
    codec: Arc<FrameCodec>,
    max_conn_num: usize,
    pending_write_num: usize,
    new_agent: NewAgent<TcpConn>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    async fn run(self, mut shutdown: Shutdown) {
        while let Some((socket, remote_addr)) = accept(&self.listener, &mut shutdown).await {
            let admission = self.conns.admit(self.max_conn_num, || {
                TcpConn::new(socket, self.pending_write_num, self.codec.clone()).map(Arc::new)
            });
            let conn = match admission {
                Admission::Admitted(conn) => conn,
                other => {
                    reject(other, remote_addr);
                    continue;
                }
            };

            let agent = (self.new_agent)(conn.clone());
            tokio::spawn(drive_agent(
                conn,
                agent,
                self.conns.clone(),
                self.shutdown_complete_tx.clone(),
            ));
        }
        debug!("tcp accept loop exited");
    }
}

impl TcpServer {
    pub fn new<F>(config: TcpServerConfig, new_agent: F) -> TcpServer
    where
        F: Fn(Arc<TcpConn>) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        TcpServer {
            config,
            new_agent: Arc::new(new_agent),
            conns: Arc::new(ConnSet::new()),
            local_addr: None,
            notify_shutdown,
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
            accept_handle: None,
        }
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn start(&mut self) -> AppResult<()> {
        let Some(shutdown_complete_tx) = self.shutdown_complete_tx.clone() else {
            return Err(AppError::IllegalStateError("tcp server already closed".into()));
        };
        if self.accept_handle.is_some() {
            return Err(AppError::IllegalStateError("tcp server already started".into()));
        }
        self.config.resolve_defaults();

        let listener = TcpListener::bind(&self.config.addr).await.map_err(|err| {
            error!("failed to bind tcp server to {}: {}", self.config.addr, err);
            err
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("tcp server listening on {}", local_addr);

        let acceptor = Acceptor {
            listener,
            conns: self.conns.clone(),
            codec: Arc::new(FrameCodec::from_config(&self.config.frame)),
            max_conn_num: self.config.max_conn_num,
            pending_write_num: self.config.pending_write_num,
            new_agent: self.new_agent.clone(),
            shutdown_complete_tx,
        };
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        self.accept_handle = Some(tokio::spawn(acceptor.run(shutdown)));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Stops accepting, closes every live connection and waits for their tasks.
    pub async fn close(&mut self) {
        let _ = self.notify_shutdown.send(());
        if let Some(handle) = self.accept_handle.take() {
            if let Err(err) = handle.await {
                error!("tcp accept loop failed: {}", err);
            }
        }

        self.conns.close_all();
        drop(self.shutdown_complete_tx.take());
        let _ = self.shutdown_complete_rx.recv().await;
        info!("tcp server {} closed", self.config.addr);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
