//! Transports: framed TCP and WebSocket connections, acceptors, a dialer,
//! and the message processors that decode and route traffic.

mod conn;
pub mod json;
mod msg_codec;
mod processor;
pub mod protobuf;
mod tcp_client;
mod tcp_conn;
mod tcp_server;
mod ws_conn;
mod ws_server;

pub use conn::{Agent, Conn};
pub use msg_codec::MsgCodec;
pub use processor::Processor;
pub use tcp_client::TcpClient;
pub use tcp_conn::TcpConn;
pub use tcp_server::{NewAgent as NewTcpAgent, TcpServer};
pub use ws_conn::WsConn;
pub use ws_server::{NewAgent as NewWsAgent, WsServer};
