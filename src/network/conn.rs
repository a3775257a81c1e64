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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The capability set shared by every transport.
///
/// `read_msg` is driven by exactly one task, the agent's read loop. Every
/// other method may be called from any task at any time.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Process-unique id, used as the key of a manager's live set.
    fn id(&self) -> u64;

    /// Reads the next message payload.
    ///
    /// `Ok(None)` means the peer closed the stream cleanly. Once the connection
    /// is closed a pending read returns `ConnectionClosed`.
    async fn read_msg(&self) -> AppResult<Option<Bytes>>;

    /// Queues `parts` as one message without blocking.
    ///
    /// A saturated queue fails with `WriteQueueFull` and destroys the connection.
    fn write_msg(&self, parts: &[&[u8]]) -> AppResult<()>;

    /// Flushes already queued messages, then releases the socket.
    fn close(&self);

    /// Drops queued messages and resets the socket at once.
    fn destroy(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    /// sentinel, the writer flushes everything queued before it and exits
    Stop,
}

/// The outbound half of a connection: a bounded queue drained by one writer
/// task, plus the one-shot closed signal.
///
/// Enqueueing a frame and enqueueing the stop sentinel happen under
/// `send_lock`, so no frame accepted with `Ok` can land behind the sentinel.
#[derive(Debug)]
pub(crate) struct WriteQueue {
    id: u64,
    tx: mpsc::Sender<Outbound>,
    send_lock: Mutex<()>,
    close_flag: AtomicBool,
    closed: CancellationToken,
    abort: CancellationToken,
}

impl WriteQueue {
    pub(crate) fn new(pending_write_num: usize) -> (Arc<WriteQueue>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(pending_write_num.max(1));
        let queue = WriteQueue {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            send_lock: Mutex::new(()),
            close_flag: AtomicBool::new(false),
            closed: CancellationToken::new(),
            abort: CancellationToken::new(),
        };
        (Arc::new(queue), rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_flag.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed by any side.
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Fires the closed signal; returns true only for the first caller.
    pub(crate) fn begin_close(&self) -> bool {
        let _guard = self.send_lock.lock();
        self.mark_closed()
    }

    // caller holds send_lock
    fn mark_closed(&self) -> bool {
        let first = !self.close_flag.swap(true, Ordering::AcqRel);
        self.closed.cancel();
        first
    }

    pub(crate) fn push(&self, frame: Bytes) -> AppResult<()> {
        let res = {
            let _guard = self.send_lock.lock();
            if self.is_closed() {
                return Err(AppError::ConnectionClosed);
            }
            self.tx.try_send(Outbound::Frame(frame))
        };
        match res {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("connection {} write channel full, destroying", self.id);
                self.destroy();
                Err(AppError::WriteQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed),
        }
    }

    pub(crate) fn close(&self) {
        let _guard = self.send_lock.lock();
        if self.is_closed() {
            return;
        }
        // no room for the sentinel, fall back to an abortive close
        if self.tx.try_send(Outbound::Stop).is_err() {
            trace!("connection {} has no room for the stop sentinel, aborting", self.id);
            self.abort.cancel();
        }
        self.mark_closed();
    }

    /// The abort token fires before the closed signal, so a reader woken by
    /// `closed()` already sees the abort.
    pub(crate) fn destroy(&self) {
        let _guard = self.send_lock.lock();
        if self.is_closed() {
            return;
        }
        self.abort.cancel();
        self.mark_closed();
        if let Err(err) = self.tx.try_send(Outbound::Stop) {
            trace!("connection {} stop sentinel not queued: {}", self.id, err);
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// The socket side a writer task drains into.
#[async_trait]
pub(crate) trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: Bytes) -> AppResult<()>;

    /// Graceful end of the write side once the queue is flushed.
    async fn shutdown(&mut self);

    /// Abortive end, nothing more is sent.
    fn abort(self);
}

enum WriterExit {
    Flushed,
    Failed,
    Aborted,
}

/// Drains `rx` into `sink` in submission order until the stop sentinel, the
/// first write failure, or an abort.
pub(crate) async fn run_writer<S: FrameSink>(
    queue: Arc<WriteQueue>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: S,
) {
    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = queue.abort.cancelled() => break WriterExit::Aborted,
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Stop) | None => break WriterExit::Flushed,
            },
        };
        tokio::select! {
            biased;
            _ = queue.abort.cancelled() => break WriterExit::Aborted,
            res = sink.send_frame(frame) => {
                if let Err(err) = res {
                    debug!("connection {} write error: {}", queue.id, err);
                    break WriterExit::Failed;
                }
            }
        }
    };

    queue.begin_close();
    match exit {
        WriterExit::Flushed => sink.shutdown().await,
        WriterExit::Failed => {}
        WriterExit::Aborted => sink.abort(),
    }
    trace!("connection {} writer exited", queue.id);
}
