use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream};
use tracing::{error, info};

use super::agent::ConnSet;
use super::dial::{Connector, DialWorker};
use super::{Agent, NewAgent, WsConn};
use crate::service::WsClientConfig;
use crate::{AppError, AppResult, Shutdown};

pub(crate) fn ws_config(max_msg_len: u32) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_msg_len as usize);
    config.max_frame_size = Some(max_msg_len as usize);
    config
}

struct WsConnector {
    url: String,
    pending_write_num: usize,
    max_msg_len: u32,
    handshake_timeout: Duration,
}

#[async_trait]
impl Connector for WsConnector {
    type Conn = WsConn;

    fn peer(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> AppResult<WsConn> {
        let handshake = connect_async_with_config(self.url.as_str(), Some(ws_config(self.max_msg_len)), false);
        let (stream, _response) = time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| AppError::HandshakeTimeout(self.url.clone()))??;

        let (local_addr, remote_addr) = match stream.get_ref() {
            MaybeTlsStream::Plain(socket) => (socket.local_addr()?, socket.peer_addr()?),
            _ => {
                return Err(AppError::IllegalStateError(format!(
                    "unsupported stream for {}",
                    self.url
                )))
            }
        };
        Ok(WsConn::new(
            stream,
            self.pending_write_num,
            self.max_msg_len,
            local_addr,
            remote_addr,
        ))
    }
}

/// Keeps `conn_num` websocket connections to one `ws://` url.
pub struct WsClient {
    config: WsClientConfig,
    new_agent: NewAgent<WsConn>,
    conns: Arc<ConnSet>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    workers: Vec<JoinHandle<()>>,
}

impl WsClient {
    pub fn new<F>(config: WsClientConfig, new_agent: F) -> WsClient
    where
        F: Fn(Arc<WsConn>) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        WsClient {
            config,
            new_agent: Arc::new(new_agent),
            conns: Arc::new(ConnSet::new()),
            notify_shutdown,
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
            workers: Vec::new(),
        }
    }

    pub fn start(&mut self) -> AppResult<()> {
        let Some(shutdown_complete_tx) = self.shutdown_complete_tx.clone() else {
            return Err(AppError::IllegalStateError("ws client already closed".into()));
        };
        if !self.workers.is_empty() {
            return Err(AppError::IllegalStateError("ws client already started".into()));
        }
        self.config.resolve_defaults();

        let connector = Arc::new(WsConnector {
            url: self.config.addr.clone(),
            pending_write_num: self.config.pending_write_num,
            max_msg_len: self.config.max_msg_len,
            handshake_timeout: self.config.handshake_timeout(),
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
            "ws client started {} dial workers for {}",
            self.config.conn_num, self.config.addr
        );
        Ok(())
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub async fn close(&mut self) {
        self.conns.close_all();
        let _ = self.notify_shutdown.send(());
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                error!("ws dial worker failed: {}", err);
            }
        }

        drop(self.shutdown_complete_tx.take());
        let _ = self.shutdown_complete_rx.recv().await;
        info!("ws client for {} closed", self.config.addr);
    }
}
