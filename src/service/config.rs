use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AppError, AppResult};

pub const DEFAULT_MAX_CONN_NUM: usize = 100;
pub const DEFAULT_PENDING_WRITE_NUM: usize = 100;
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;
pub const DEFAULT_CONN_NUM: usize = 1;
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

fn reset_usize(value: &mut usize, default: usize, name: &str) {
    if *value == 0 {
        *value = default;
        info!("invalid {}, reset to {}", name, default);
    }
}

fn reset_u32(value: &mut u32, default: u32, name: &str) {
    if *value == 0 {
        *value = default;
        info!("invalid {}, reset to {}", name, default);
    }
}

fn reset_millis(value: &mut u64, default: u64, name: &str) {
    if *value == 0 {
        *value = default;
        info!("invalid {}, reset to {}ms", name, default);
    }
}

/// Framing settings of a tcp manager. Zero values fall back to the
/// [`FrameCodec`](crate::FrameCodec) defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameConfig {
    /// width of the length prefix, 1, 2 or 4 bytes
    pub len_msg_len: usize,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    pub little_endian: bool,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpServerConfig {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    #[serde(flatten)]
    pub frame: FrameConfig,
}

impl TcpServerConfig {
    pub fn resolve_defaults(&mut self) {
        reset_usize(&mut self.max_conn_num, DEFAULT_MAX_CONN_NUM, "max_conn_num");
        reset_usize(
            &mut self.pending_write_num,
            DEFAULT_PENDING_WRITE_NUM,
            "pending_write_num",
        );
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpClientConfig {
    pub addr: String,
    pub conn_num: usize,
    pub connect_interval_ms: u64,
    pub pending_write_num: usize,
    pub auto_reconnect: bool,
    #[serde(flatten)]
    pub frame: FrameConfig,
}

impl TcpClientConfig {
    pub fn resolve_defaults(&mut self) {
        reset_usize(&mut self.conn_num, DEFAULT_CONN_NUM, "conn_num");
        reset_millis(
            &mut self.connect_interval_ms,
            DEFAULT_CONNECT_INTERVAL_MS,
            "connect_interval",
        );
        reset_usize(
            &mut self.pending_write_num,
            DEFAULT_PENDING_WRITE_NUM,
            "pending_write_num",
        );
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WsServerConfig {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub http_timeout_ms: u64,
    /// PEM certificate chain, tls is enabled when either file is set
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl WsServerConfig {
    pub fn resolve_defaults(&mut self) {
        reset_usize(&mut self.max_conn_num, DEFAULT_MAX_CONN_NUM, "max_conn_num");
        reset_usize(
            &mut self.pending_write_num,
            DEFAULT_PENDING_WRITE_NUM,
            "pending_write_num",
        );
        reset_u32(&mut self.max_msg_len, DEFAULT_MAX_MSG_LEN, "max_msg_len");
        reset_millis(
            &mut self.http_timeout_ms,
            DEFAULT_HTTP_TIMEOUT_MS,
            "http_timeout",
        );
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some()
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WsClientConfig {
    /// `ws://host:port/path`
    pub addr: String,
    pub conn_num: usize,
    pub connect_interval_ms: u64,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub handshake_timeout_ms: u64,
    pub auto_reconnect: bool,
}

impl WsClientConfig {
    pub fn resolve_defaults(&mut self) {
        reset_usize(&mut self.conn_num, DEFAULT_CONN_NUM, "conn_num");
        reset_millis(
            &mut self.connect_interval_ms,
            DEFAULT_CONNECT_INTERVAL_MS,
            "connect_interval",
        );
        reset_usize(
            &mut self.pending_write_num,
            DEFAULT_PENDING_WRITE_NUM,
            "pending_write_num",
        );
        reset_u32(&mut self.max_msg_len, DEFAULT_MAX_MSG_LEN, "max_msg_len");
        reset_millis(
            &mut self.handshake_timeout_ms,
            DEFAULT_HTTP_TIMEOUT_MS,
            "handshake_timeout",
        );
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings shared by the servers a [`Gate`](crate::Gate) runs.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,

    // tcp
    pub tcp_addr: Option<String>,
    pub len_msg_len: usize,
    pub little_endian: bool,

    // websocket
    pub ws_addr: Option<String>,
    pub http_timeout_ms: u64,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl GateConfig {
    pub fn tcp_server_config(&self) -> Option<TcpServerConfig> {
        let addr = self.tcp_addr.clone()?;
        Some(TcpServerConfig {
            addr,
            max_conn_num: self.max_conn_num,
            pending_write_num: self.pending_write_num,
            frame: FrameConfig {
                len_msg_len: self.len_msg_len,
                min_msg_len: 0,
                max_msg_len: self.max_msg_len,
                little_endian: self.little_endian,
            },
        })
    }

    pub fn ws_server_config(&self) -> Option<WsServerConfig> {
        let addr = self.ws_addr.clone()?;
        Some(WsServerConfig {
            addr,
            max_conn_num: self.max_conn_num,
            pending_write_num: self.pending_write_num,
            max_msg_len: self.max_msg_len,
            http_timeout_ms: self.http_timeout_ms,
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
        })
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// directory for the hourly rolling log file, stdout only when unset
    pub dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub gate: GateConfig,
    pub tcp_client: Option<TcpClientConfig>,
    pub ws_client: Option<WsClientConfig>,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidConfig(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }
}
