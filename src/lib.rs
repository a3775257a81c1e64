mod gate;
mod network;
mod processor;
mod service;

pub use gate::{AgentLifecycle, Gate, GateAgent, RunningGate};
pub use network::{
    load_tls_acceptor, Agent, ByteOrder, Conn, FrameCodec, NewAgent, TcpClient, TcpConn,
    TcpServer, WsClient, WsConn, WsServer,
};
pub use processor::{
    AnyMessage, Decoded, JsonProcessor, MessageRouter, MsgId, NamedMessage, Processor,
    ProtobufProcessor, RawMessage, RoutedMessage, UserData,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppConfig, AppError, AppResult, FrameConfig, GateConfig,
    LogConfig, Shutdown, TcpClientConfig, TcpServerConfig, WsClientConfig, WsServerConfig,
};
