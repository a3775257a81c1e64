//! Transport layer.
//!
//! A [`Conn`] is one live connection with a dedicated writer task fed by a
//! bounded queue. [`TcpConn`] carries length-prefixed frames produced by the
//! [`FrameCodec`]; [`WsConn`] carries one binary websocket message per
//! application message.
//!
//! The connection managers own the live set of connections and drive one
//! [`Agent`] per connection:
//!
//! - [`TcpServer`] and [`WsServer`] accept connections up to `max_conn_num`
//! - [`TcpClient`] and [`WsClient`] run `conn_num` dial workers that retry at a
//!   fixed interval and optionally reconnect
//!
//! Closing a manager stops accepting or dialing, closes every live connection
//! and waits until every task it spawned has finished.

pub use agent::{Agent, NewAgent};
pub use conn::Conn;
pub use frame::{ByteOrder, FrameCodec};
pub use tcp_client::TcpClient;
pub use tcp_conn::TcpConn;
pub use tcp_server::TcpServer;
pub use tls::load_tls_acceptor;
pub use ws_client::WsClient;
pub use ws_conn::WsConn;
pub use ws_server::WsServer;

mod accept;
mod agent;
mod conn;
mod dial;
mod frame;
mod tcp_client;
mod tcp_conn;
mod tcp_server;
mod tls;
mod ws_client;
mod ws_conn;
mod ws_server;
