use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::network::{Agent, Conn};
use crate::processor::{AnyMessage, Processor, UserData};
use crate::{AppError, AppResult};

/// Receives every gate agent when it is created and when it is torn down.
#[async_trait]
pub trait AgentLifecycle: Send + Sync + 'static {
    /// Called once the agent exists, before its read loop starts. Must not block.
    fn new_agent(&self, agent: Arc<GateAgent>);

    /// Called after the connection is closed. The connection manager waits for it.
    async fn close_agent(&self, agent: &GateAgent) -> AppResult<()>;
}

/// Reads messages from one connection and hands them to the processor.
pub struct GateAgent {
    conn: Arc<dyn Conn>,
    processor: Arc<dyn Processor>,
    lifecycle: Option<Arc<dyn AgentLifecycle>>,
    user_data: Mutex<UserData>,
}

impl GateAgent {
    pub fn new(
        conn: Arc<dyn Conn>,
        processor: Arc<dyn Processor>,
        lifecycle: Option<Arc<dyn AgentLifecycle>>,
    ) -> Arc<GateAgent> {
        let agent = Arc::new(GateAgent {
            conn,
            processor,
            lifecycle,
            user_data: Mutex::new(None),
        });
        if let Some(lifecycle) = &agent.lifecycle {
            lifecycle.new_agent(agent.clone());
        }
        agent
    }

    /// Id of the underlying connection.
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    /// Encodes `msg` and queues it on the connection.
    pub fn write_msg(&self, msg: &dyn AnyMessage) -> AppResult<()> {
        let parts = self.processor.encode(msg).map_err(|err| {
            error!("encode message {} error: {}", msg.message_name(), err);
            err
        })?;
        let parts: Vec<&[u8]> = parts.iter().map(|part| part.as_ref()).collect();
        self.conn.write_msg(&parts).map_err(|err| {
            error!(
                "write message {} to {} error: {}",
                msg.message_name(),
                self.conn.remote_addr(),
                err
            );
            err
        })
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn destroy(&self) {
        self.conn.destroy();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn user_data(&self) -> UserData {
        self.user_data.lock().clone()
    }

    pub fn set_user_data(&self, user_data: UserData) {
        *self.user_data.lock() = user_data;
    }

    fn log_exit(&self, stage: &str, err: &AppError) {
        match err {
            AppError::ConnectionClosed => trace!("connection {} closed locally", self.conn.remote_addr()),
            err if err.is_routine_disconnect() => {
                debug!("{} from {} error: {}", stage, self.conn.remote_addr(), err)
            }
            err => warn!("{} from {} error: {}", stage, self.conn.remote_addr(), err),
        }
    }
}

#[async_trait]
impl Agent for GateAgent {
    async fn run(&self) {
        loop {
            let data = match self.conn.read_msg().await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    trace!("connection {} closed by peer", self.conn.remote_addr());
                    break;
                }
                Err(err) => {
                    self.log_exit("read message", &err);
                    break;
                }
            };

            let msg = match self.processor.decode(data) {
                Ok(msg) => msg,
                Err(err) => {
                    self.log_exit("decode message", &err);
                    break;
                }
            };
            if let Err(err) = self.processor.dispatch(msg, &self.user_data()) {
                self.log_exit("dispatch message", &err);
                break;
            }
        }
    }

    async fn on_close(&self) {
        if let Some(lifecycle) = &self.lifecycle {
            if let Err(err) = lifecycle.close_agent(self).await {
                error!("close agent {} error: {}", self.conn.remote_addr(), err);
            }
        }
    }
}
