use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, error, info};

use super::accept::accept;
use super::agent::{drive_agent, reject, Admission, ConnSet};
use super::tls::load_tls_acceptor;
use super::ws_client::ws_config;
use super::{Agent, NewAgent, WsConn};
use crate::service::WsServerConfig;
use crate::{AppError, AppResult, Shutdown};

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type ServerStream = Box<dyn IoStream>;

/// Accepts websocket upgrades, optionally over TLS, and runs one agent per connection.
pub struct WsServer {
    config: WsServerConfig,
    new_agent: NewAgent<WsConn>,
    conns: Arc<ConnSet>,
    local_addr: Option<SocketAddr>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    accept_handle: Option<JoinHandle<()>>,
}

/// State every per-socket task needs.
struct Upgrader {
    conns: Arc<ConnSet>,
    tls: Option<TlsAcceptor>,
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
    new_agent: NewAgent<WsConn>,
}

impl Upgrader {
    async fn handshake(&self, socket: TcpStream) -> AppResult<WebSocketStream<ServerStream>> {
        let stream: ServerStream = match &self.tls {
            Some(acceptor) => Box::new(acceptor.accept(socket).await?),
            None => Box::new(socket),
        };
        // rejects anything but a GET upgrade request
        let ws = accept_async_with_config(stream, Some(ws_config(self.max_msg_len))).await?;
        Ok(ws)
    }

    async fn serve(
        self: Arc<Self>,
        socket: TcpStream,
        remote_addr: SocketAddr,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                debug!("socket from {} unusable: {}", remote_addr, err);
                return;
            }
        };

        let upgraded = tokio::select! {
            _ = shutdown.recv() => return,
            res = time::timeout(self.http_timeout, self.handshake(socket)) => res,
        };
        let stream = match upgraded {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("websocket handshake with {} failed: {}", remote_addr, err);
                return;
            }
            Err(_) => {
                debug!("{}", AppError::HandshakeTimeout(remote_addr.to_string()));
                return;
            }
        };

        let admission = self.conns.admit(self.max_conn_num, || {
            Ok(Arc::new(WsConn::new(
                stream,
                self.pending_write_num,
                self.max_msg_len,
                local_addr,
                remote_addr,
            )))
        });
        let conn = match admission {
            Admission::Admitted(conn) => conn,
            other => {
                reject(other, remote_addr);
                return;
            }
        };

        let agent = (self.new_agent)(conn.clone());
        drive_agent(conn, agent, self.conns.clone(), shutdown_complete_tx).await;
    }
}

impl WsServer {
    pub fn new<F>(config: WsServerConfig, new_agent: F) -> WsServer
    where
        F: Fn(Arc<WsConn>) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        WsServer {
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

    /// Loads TLS material when configured, binds and spawns the accept loop.
    pub async fn start(&mut self) -> AppResult<()> {
        let Some(shutdown_complete_tx) = self.shutdown_complete_tx.clone() else {
            return Err(AppError::IllegalStateError("ws server already closed".into()));
        };
        if self.accept_handle.is_some() {
            return Err(AppError::IllegalStateError("ws server already started".into()));
        }
        self.config.resolve_defaults();

        let tls = if self.config.tls_enabled() {
            let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file) else {
                return Err(AppError::InvalidConfig(
                    "both cert_file and key_file are required for tls".into(),
                ));
            };
            Some(load_tls_acceptor(cert_file, key_file)?)
        } else {
            None
        };

        let listener = TcpListener::bind(&self.config.addr).await.map_err(|err| {
            error!("failed to bind ws server to {}: {}", self.config.addr, err);
            err
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!(
            "ws server listening on {}{}",
            local_addr,
            if tls.is_some() { " with tls" } else { "" }
        );

        let upgrader = Arc::new(Upgrader {
            conns: self.conns.clone(),
            tls,
            max_conn_num: self.config.max_conn_num,
            pending_write_num: self.config.pending_write_num,
            max_msg_len: self.config.max_msg_len,
            http_timeout: self.config.http_timeout(),
            new_agent: self.new_agent.clone(),
        });
        let notify_shutdown = self.notify_shutdown.clone();
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        self.accept_handle = Some(tokio::spawn(async move {
            loop {
                // subscribed before accepting so a close racing the accept is still seen
                let task_shutdown = Shutdown::subscribe(&notify_shutdown);
                let Some((socket, remote_addr)) = accept(&listener, &mut shutdown).await else {
                    break;
                };
                tokio::spawn(upgrader.clone().serve(
                    socket,
                    remote_addr,
                    task_shutdown,
                    shutdown_complete_tx.clone(),
                ));
            }
            debug!("ws accept loop exited");
        }));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Stops accepting, closes every live connection and waits for their tasks,
    /// including handshakes still in flight.
    pub async fn close(&mut self) {
        let _ = self.notify_shutdown.send(());
        if let Some(handle) = self.accept_handle.take() {
            if let Err(err) = handle.await {
                error!("ws accept loop failed: {}", err);
            }
        }

        self.conns.close_all();
        drop(self.shutdown_complete_tx.take());
        let _ = self.shutdown_complete_rx.recv().await;
        info!("ws server {} closed", self.config.addr);
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        debug!("ws server dropped");
    }
}
