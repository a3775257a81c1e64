use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use super::conn::{run_writer, FrameSink, WriteQueue};
use super::{Conn, FrameCodec};
use crate::{AppError, AppResult};

struct FrameReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
}

struct TcpSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_frame(&mut self, frame: Bytes) -> AppResult<()> {
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            trace!("tcp shutdown error: {}", err);
        }
    }

    fn abort(self) {
        if let Err(err) = self.writer.as_ref().set_linger(Some(Duration::ZERO)) {
            trace!("tcp set linger error: {}", err);
        }
        // no FIN; the socket resets once the read half is released too
        self.writer.forget();
    }
}

/// A tcp connection carrying length-prefixed frames.
pub struct TcpConn {
    queue: Arc<WriteQueue>,
    /// released on destroy so the socket can reset
    reader: Mutex<Option<FrameReader>>,
    codec: Arc<FrameCodec>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpConn {
    /// Wraps `socket` and spawns its writer task.
    pub fn new(socket: TcpStream, pending_write_num: usize, codec: Arc<FrameCodec>) -> AppResult<TcpConn> {
        let local_addr = socket.local_addr()?;
        let remote_addr = socket.peer_addr()?;
        let (reader, writer) = socket.into_split();

        let (queue, rx) = WriteQueue::new(pending_write_num);
        tokio::spawn(run_writer(queue.clone(), rx, TcpSink { writer }));
        trace!("tcp connection {} established with {}", queue.id(), remote_addr);

        Ok(TcpConn {
            queue,
            reader: Mutex::new(Some(FrameReader {
                reader,
                buffer: BytesMut::with_capacity(4 * 1024),
            })),
            codec,
            local_addr,
            remote_addr,
        })
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }
}

#[async_trait]
impl Conn for TcpConn {
    fn id(&self) -> u64 {
        self.queue.id()
    }

    async fn read_msg(&self) -> AppResult<Option<Bytes>> {
        let mut guard = self.reader.lock().await;
        if self.queue.is_closed() {
            if self.queue.is_aborted() {
                *guard = None;
            }
            return Err(AppError::ConnectionClosed);
        }
        let Some(FrameReader { reader, buffer }) = (*guard).as_mut() else {
            return Err(AppError::ConnectionClosed);
        };
        let res = tokio::select! {
            biased;
            _ = self.queue.closed() => Err(AppError::ConnectionClosed),
            res = self.codec.read_frame(reader, buffer) => res,
        };
        if self.queue.is_aborted() {
            *guard = None;
        }
        res
    }

    fn write_msg(&self, parts: &[&[u8]]) -> AppResult<()> {
        if self.queue.is_closed() {
            return Err(AppError::ConnectionClosed);
        }
        let frame = self.codec.encode(parts)?;
        self.queue.push(frame)
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
