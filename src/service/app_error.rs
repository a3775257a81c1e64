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

use tokio_tungstenite::tungstenite;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// transport errors
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// framing errors
    #[error("message too short: {0} bytes")]
    MessageTooShort(u64),

    #[error("message too long: {0} bytes")]
    MessageTooLong(u64),

    /// marker error, more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,

    /// codec errors
    #[error("message {0} not registered")]
    UnregisteredMessage(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// capacity errors
    #[error("write channel full")]
    WriteQueueFull,

    /// configuration errors, only raised during setup
    #[error("message {0} is already registered")]
    DuplicateRegistration(String),

    #[error("too many messages (max = {0})")]
    TooManyMessages(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("illegal state: {0}")]
    IllegalStateError(String),
}

impl AppError {
    /// Framing and codec failures end a connection the same way a peer hang-up
    /// does, so they are logged as routine disconnects rather than incidents.
    pub fn is_routine_disconnect(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_)
                | AppError::WebSocket(_)
                | AppError::ConnectionClosed
                | AppError::MessageTooShort(_)
                | AppError::MessageTooLong(_)
        )
    }
}
