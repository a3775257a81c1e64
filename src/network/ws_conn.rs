use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use super::conn::{run_writer, FrameSink, WriteQueue};
use super::Conn;
use crate::{AppError, AppResult};

type MessageStream = BoxStream<'static, Result<Message, tungstenite::Error>>;

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> AppResult<()> {
        self.sink.send(Message::Binary(frame.to_vec())).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        // sends the close frame and flushes
        if let Err(err) = self.sink.close().await {
            trace!("websocket close frame error: {}", err);
        }
    }

    fn abort(self) {}
}

/// A websocket connection, one binary message per application message.
pub struct WsConn {
    queue: Arc<WriteQueue>,
    reader: Mutex<MessageStream>,
    max_msg_len: u32,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl WsConn {
    /// Wraps an upgraded stream and spawns its writer task.
    pub fn new<S>(
        stream: WebSocketStream<S>,
        pending_write_num: usize,
        max_msg_len: u32,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> WsConn
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        let (queue, rx) = WriteQueue::new(pending_write_num);
        tokio::spawn(run_writer(queue.clone(), rx, WsSink { sink }));
        trace!("ws connection {} established with {}", queue.id(), remote_addr);

        WsConn {
            queue,
            reader: Mutex::new(stream.boxed()),
            max_msg_len,
            local_addr,
            remote_addr,
        }
    }

    async fn next_payload(stream: &mut MessageStream) -> AppResult<Option<Bytes>> {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                // pongs are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl Conn for WsConn {
    fn id(&self) -> u64 {
        self.queue.id()
    }

    async fn read_msg(&self) -> AppResult<Option<Bytes>> {
        let mut stream = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.queue.closed() => Err(AppError::ConnectionClosed),
            res = Self::next_payload(&mut stream) => res,
        }
    }

    fn write_msg(&self, parts: &[&[u8]]) -> AppResult<()> {
        if self.queue.is_closed() {
            return Err(AppError::ConnectionClosed);
        }

        let msg_len: u64 = parts.iter().map(|part| part.len() as u64).sum();
        if msg_len > self.max_msg_len as u64 {
            return Err(AppError::MessageTooLong(msg_len));
        } else if msg_len < 1 {
            return Err(AppError::MessageTooShort(msg_len));
        }

        let data = match parts {
            [single] => Bytes::copy_from_slice(single),
            _ => Bytes::from(parts.concat()),
        };
        self.queue.push(data)
    }

    fn close(&self) {
        self.queue.close();
    }

    fn destroy(&self) {
        self.queue.destroy();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn conn_pair() -> (WsConn, WebSocketStream<tokio::io::DuplexStream>) {
        let (server, client) = duplex(4096);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let addr = SocketAddr::from(([127, 0, 0, 1], 3653));
        (WsConn::new(server, 10, 16, addr, addr), client)
    }

    #[tokio::test]
    async fn test_parts_become_one_binary_message() {
        let (conn, mut peer) = conn_pair().await;
        conn.write_msg(&[&b"\x00\x01"[..], &b"body"[..]]).unwrap();
        let msg = peer.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Binary(b"\x00\x01body".to_vec()));

        peer.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(conn.read_msg().await.unwrap().as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_length_bounds() {
        let (conn, _peer) = conn_pair().await;
        assert!(matches!(conn.write_msg(&[]), Err(AppError::MessageTooShort(0))));
        assert!(matches!(
            conn.write_msg(&[&[0u8; 17][..]]),
            Err(AppError::MessageTooLong(17))
        ));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_frame_ends_reading() {
        let (conn, mut peer) = conn_pair().await;
        peer.close(None).await.unwrap();
        assert!(conn.read_msg().await.unwrap().is_none());

        conn.close();
        assert!(matches!(conn.write_msg(&[&b"late"[..]]), Err(AppError::ConnectionClosed)));
    }
}
