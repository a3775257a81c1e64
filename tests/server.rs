use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gatewire::{
    Agent, AgentLifecycle, AppError, AppResult, Conn, Gate, GateAgent, GateConfig, JsonProcessor,
    NamedMessage, TcpClient, TcpClientConfig, TcpServer, TcpServerConfig, UserData, WsClient,
    WsClientConfig, WsServer, WsServerConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

impl NamedMessage for Ping {
    const NAME: &'static str = "Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}

impl NamedMessage for Pong {
    const NAME: &'static str = "Pong";
}

#[derive(Default)]
struct Registry {
    agents: Mutex<HashMap<u64, Arc<GateAgent>>>,
    closed: AtomicUsize,
}

#[async_trait]
impl AgentLifecycle for Registry {
    fn new_agent(&self, agent: Arc<GateAgent>) {
        agent.set_user_data(Some(Arc::new(agent.id())));
        self.agents.lock().insert(agent.id(), agent);
    }

    async fn close_agent(&self, agent: &GateAgent) -> AppResult<()> {
        self.agents.lock().remove(&agent.id());
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ping_pong_processor(registry: &Arc<Registry>) -> JsonProcessor {
    let mut processor = JsonProcessor::new();
    processor.register::<Ping>().unwrap();
    processor.register::<Pong>().unwrap();
    let registry = registry.clone();
    processor
        .set_handler::<Ping, _>(move |ping: &Ping, user_data: &UserData| {
            let id = user_data
                .as_ref()
                .and_then(|user_data| user_data.downcast_ref::<u64>().copied());
            let agent = id.and_then(|id| registry.agents.lock().get(&id).cloned());
            if let Some(agent) = agent {
                agent.write_msg(&Pong { seq: ping.seq }).unwrap();
            }
        })
        .unwrap();
    processor
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len = stream.read_u16().await.unwrap();
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_u16(payload.len() as u16).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

#[tokio::test]
async fn test_gate_answers_ping_over_tcp() {
    let registry = Arc::new(Registry::default());
    let processor = ping_pong_processor(&registry);
    let config = GateConfig {
        tcp_addr: Some("127.0.0.1:0".into()),
        ..Default::default()
    };
    let gate = Gate::new(config, Arc::new(processor), Some(registry.clone()));
    let mut running = gate.start().await.unwrap();
    let addr = running.tcp_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, br#"{"Ping":{"seq":7}}"#).await;
    let reply = timeout(Duration::from_secs(5), read_frame(&mut client)).await.unwrap();
    assert_eq!(reply, br#"{"Pong":{"seq":7}}"#);

    // an unregistered message ends the connection
    write_frame(&mut client, br#"{"Move":{}}"#).await;
    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await.unwrap();
    wait_until("close_agent", || registry.closed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(running.conn_count(), 0);

    running.close().await;
}

#[tokio::test]
async fn test_gate_requires_an_address() {
    let gate = Gate::new(GateConfig::default(), Arc::new(JsonProcessor::new()), None);
    assert!(matches!(gate.start().await, Err(AppError::InvalidConfig(_))));
}

/// Writes every message back to its sender.
struct Echo {
    conn: Arc<dyn Conn>,
}

#[async_trait]
impl Agent for Echo {
    async fn run(&self) {
        while let Ok(Some(msg)) = self.conn.read_msg().await {
            if self.conn.write_msg(&[&msg[..]]).is_err() {
                break;
            }
        }
    }

    async fn on_close(&self) {}
}

/// Sends one greeting, then reports everything it receives.
struct Probe {
    conn: Arc<dyn Conn>,
    received: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Agent for Probe {
    async fn run(&self) {
        if self.conn.write_msg(&[&b"hello "[..], &b"gate"[..]]).is_err() {
            return;
        }
        while let Ok(Some(msg)) = self.conn.read_msg().await {
            let _ = self.received.send(msg);
        }
    }

    async fn on_close(&self) {}
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_sockets() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let mut server = TcpServer::new(
        TcpServerConfig {
            addr: "127.0.0.1:0".into(),
            max_conn_num: 1,
            ..Default::default()
        },
        move |conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Echo { conn }) as Arc<dyn Agent>
        },
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    wait_until("first connection", || server.conn_count() == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let res = timeout(Duration::from_secs(5), second.read_to_end(&mut buf)).await.unwrap();
    assert!(res.map_or(true, |n| n == 0));
    assert_eq!(server.conn_count(), 1);
    // the rejected socket never reaches the agent factory
    assert_eq!(created.load(Ordering::SeqCst), 1);

    // the admitted connection still works
    write_frame(&mut first, b"still here").await;
    assert_eq!(read_frame(&mut first).await, b"still here");

    server.close().await;
    assert_eq!(server.conn_count(), 0);
}

#[tokio::test]
async fn test_tcp_client_talks_to_server() {
    let mut server = TcpServer::new(
        TcpServerConfig {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        },
        |conn| Arc::new(Echo { conn }) as Arc<dyn Agent>,
    );
    server.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = TcpClient::new(
        TcpClientConfig {
            addr: server.local_addr().unwrap().to_string(),
            conn_num: 2,
            ..Default::default()
        },
        move |conn| {
            Arc::new(Probe {
                conn,
                received: tx.clone(),
            }) as Arc<dyn Agent>
        },
    );
    client.start().unwrap();

    for _ in 0..2 {
        let echoed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello gate");
    }
    assert_eq!(client.conn_count(), 2);

    client.close().await;
    assert_eq!(client.conn_count(), 0);
    server.close().await;
}

#[tokio::test]
async fn test_tcp_client_reconnects_after_server_hangs_up() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = accepted.clone();
    let acceptor = tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut client = TcpClient::new(
        TcpClientConfig {
            addr: addr.to_string(),
            connect_interval_ms: 20,
            auto_reconnect: true,
            ..Default::default()
        },
        move |conn| {
            Arc::new(Probe {
                conn,
                received: tx.clone(),
            }) as Arc<dyn Agent>
        },
    );
    client.start().unwrap();

    wait_until("three dials", || accepted.load(Ordering::SeqCst) >= 3).await;
    timeout(Duration::from_secs(5), client.close()).await.unwrap();
    acceptor.abort();
}

#[tokio::test]
async fn test_tcp_client_close_while_dialing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut client = TcpClient::new(
        TcpClientConfig {
            addr: addr.to_string(),
            connect_interval_ms: 60_000,
            ..Default::default()
        },
        |conn| Arc::new(Echo { conn }) as Arc<dyn Agent>,
    );
    client.start().unwrap();
    sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(2), client.close()).await.unwrap();
    assert_eq!(client.conn_count(), 0);
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let mut server = WsServer::new(
        WsServerConfig {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        },
        |conn| Arc::new(Echo { conn }) as Arc<dyn Agent>,
    );
    server.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = WsClient::new(
        WsClientConfig {
            addr: format!("ws://{}", server.local_addr().unwrap()),
            ..Default::default()
        },
        move |conn| {
            Arc::new(Probe {
                conn,
                received: tx.clone(),
            }) as Arc<dyn Agent>
        },
    );
    client.start().unwrap();

    let echoed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&echoed[..], b"hello gate");
    wait_until("ws server connection", || server.conn_count() == 1).await;

    client.close().await;
    wait_until("ws server release", || server.conn_count() == 0).await;
    server.close().await;
}

#[tokio::test]
async fn test_ws_server_drops_plain_tcp_after_timeout() {
    let mut server = WsServer::new(
        WsServerConfig {
            addr: "127.0.0.1:0".into(),
            http_timeout_ms: 100,
            ..Default::default()
        },
        |conn| Arc::new(Echo { conn }) as Arc<dyn Agent>,
    );
    server.start().await.unwrap();

    // never sends an upgrade request
    let mut idle = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let mut buf = Vec::new();
    let res = timeout(Duration::from_secs(5), idle.read_to_end(&mut buf)).await.unwrap();
    assert!(res.map_or(true, |n| n == 0));
    assert_eq!(server.conn_count(), 0);

    server.close().await;
}
