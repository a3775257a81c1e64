use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::agent::ConnSet;
use super::dial::{Connector, DialWorker};
use super::{Agent, FrameCodec, NewAgent, TcpConn};
use crate::service::TcpClientConfig;
use crate::{AppError, AppResult, Shutdown};

struct TcpConnector {
    addr: String,
    pending_write_num: usize,
    codec: Arc<FrameCodec>,
}

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpConn;

    fn peer(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> AppResult<TcpConn> {
        let socket = TcpStream::connect(&self.addr).await?;
        TcpConn::new(socket, self.pending_write_num, self.codec.clone())
    }
}

/// Keeps `conn_num` framed tcp connections to one server.
pub struct TcpClient {
    config: TcpClientConfig,
    new_agent: NewAgent<TcpConn>,
    conns: Arc<ConnSet>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    workers: Vec<JoinHandle<()>>,
}

impl TcpClient {
    pub fn new<F>(config: TcpClientConfig, new_agent: F) -> TcpClient
    where
        F: Fn(Arc<TcpConn>) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        TcpClient {
            config,
            new_agent: Arc::new(new_agent),
            conns: Arc::new(ConnSet::new()),
            notify_shutdown,
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
            workers: Vec::new(),
        }
    }

    /// Spawns the dial workers. Connecting happens in the background.
    pub fn start(&mut self) -> AppResult<()> {
        let Some(shutdown_complete_tx) = self.shutdown_complete_tx.clone() else {
            return Err(AppError::IllegalStateError("tcp client already closed".into()));
        };
        if !self.workers.is_empty() {
            return Err(AppError::IllegalStateError("tcp client already started".into()));
        }
        self.config.resolve_defaults();

        let connector = Arc::new(TcpConnector {
            addr: self.config.addr.clone(),
            pending_write_num: self.config.pending_write_num,
            codec: Arc::new(FrameCodec::from_config(&self.config.frame)),
        });
        for _ in 0..self.config.conn_num {
            let worker = DialWorker {
                connector: connector.clone(),
                conns: self.conns.clone(),
                new_agent: self.new_agent.clone(),
                connect_interval: self.config.connect_interval(),
                auto_reconnect: self.config.auto_reconnect,
                shutdown_complete_tx: shutdown_complete_tx.clone(),
            };
            let shutdown = Shutdown::subscribe(&self.notify_shutdown);
            self.workers.push(tokio::spawn(worker.run(shutdown)));
        }
        info!(
            "tcp client started {} dial workers for {}",
            self.config.conn_num, self.config.addr
        );
        Ok(())
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Stops dialing, closes every connection and waits for all workers.
    pub async fn close(&mut self) {
        self.conns.close_all();
        let _ = self.notify_shutdown.send(());
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                error!("tcp dial worker failed: {}", err);
            }
        }

        drop(self.shutdown_complete_tx.take());
        let _ = self.shutdown_complete_rx.recv().await;
        info!("tcp client for {} closed", self.config.addr);
    }
}
