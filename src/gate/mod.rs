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

//! The gate runs a tcp server and/or a websocket server that share one
//! processor. Every connection gets a [`GateAgent`].

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

pub use agent::{AgentLifecycle, GateAgent};

use crate::network::{Agent, Conn, TcpServer, WsServer};
use crate::processor::Processor;
use crate::service::GateConfig;
use crate::{AppError, AppResult, Shutdown};

mod agent;

pub struct Gate {
    config: GateConfig,
    processor: Arc<dyn Processor>,
    lifecycle: Option<Arc<dyn AgentLifecycle>>,
}

/// The servers of a started [`Gate`].
pub struct RunningGate {
    tcp_server: Option<TcpServer>,
    ws_server: Option<WsServer>,
}

impl Gate {
    pub fn new(
        config: GateConfig,
        processor: Arc<dyn Processor>,
        lifecycle: Option<Arc<dyn AgentLifecycle>>,
    ) -> Gate {
        Gate {
            config,
            processor,
            lifecycle,
        }
    }

    fn agent_factory<C: Conn>(&self) -> impl Fn(Arc<C>) -> Arc<dyn Agent> + Send + Sync + 'static {
        let processor = self.processor.clone();
        let lifecycle = self.lifecycle.clone();
        move |conn: Arc<C>| -> Arc<dyn Agent> { GateAgent::new(conn, processor.clone(), lifecycle.clone()) }
    }

    /// Starts every configured server.
    pub async fn start(&self) -> AppResult<RunningGate> {
        let tcp_config = self.config.tcp_server_config();
        let ws_config = self.config.ws_server_config();
        if tcp_config.is_none() && ws_config.is_none() {
            return Err(AppError::InvalidConfig(
                "gate needs tcp_addr or ws_addr".into(),
            ));
        }

        let mut running = RunningGate {
            tcp_server: None,
            ws_server: None,
        };
        if let Some(config) = tcp_config {
            let mut server = TcpServer::new(config, self.agent_factory());
            server.start().await?;
            running.tcp_server = Some(server);
        }
        if let Some(config) = ws_config {
            let mut server = WsServer::new(config, self.agent_factory());
            if let Err(err) = server.start().await {
                error!("start ws server error: {}", err);
                running.close().await;
                return Err(err);
            }
            running.ws_server = Some(server);
        }
        info!("gate started");
        Ok(running)
    }

    /// Serves until `shutdown` fires, then closes every server.
    pub async fn run(&self, mut shutdown: Shutdown) -> AppResult<()> {
        let mut running = self.start().await?;
        shutdown.recv().await;
        running.close().await;
        Ok(())
    }
}

impl RunningGate {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_server.as_ref().and_then(TcpServer::local_addr)
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_server.as_ref().and_then(WsServer::local_addr)
    }

    pub fn conn_count(&self) -> usize {
        self.tcp_server.as_ref().map_or(0, TcpServer::conn_count)
            + self.ws_server.as_ref().map_or(0, WsServer::conn_count)
    }

    pub async fn close(&mut self) {
        if let Some(mut server) = self.tcp_server.take() {
            server.close().await;
        }
        if let Some(mut server) = self.ws_server.take() {
            server.close().await;
        }
        info!("gate closed");
    }
}
