//! The gate: acceptors + codec + processor + agent-lifecycle RPC, wired
//! into one runnable module.
//!
//! A gate starts whichever transports are configured and builds one
//! [`Agent`] per accepted connection. The agent's read loop decodes and
//! routes every message through the configured [`Processor`]; the first
//! error tears the connection down. When an agent-lifecycle RPC server is
//! configured, `NewAgent` is posted fire-and-forget on acceptance and
//! `CloseAgent` is called synchronously on close, so the logic task
//! finishes its cleanup before the connection object is released.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::chanrpc::{ServerHandle, Value};
use crate::module::{CloseSig, Module};
use crate::network::{
    Conn, NewTcpAgent, NewWsAgent, Processor, TcpConn, TcpServer, WsConn, WsServer,
};

/// Gate configuration; implements [`Module`].
pub struct Gate {
    /// Live-connection cap per transport.
    pub max_conn_num: usize,
    /// Per-connection send-queue length.
    pub pending_write_num: usize,
    /// Maximum message length.
    pub max_msg_len: u32,
    /// Message processor; without one, traffic is read and dropped.
    pub processor: Option<Arc<dyn Processor>>,
    /// Agent-lifecycle RPC server (`NewAgent` / `CloseAgent`).
    pub agent_chan_rpc: Option<ServerHandle>,

    /// WebSocket listen address; empty disables the WS transport.
    pub ws_addr: String,
    /// WS HTTP handshake/request timeout.
    pub http_timeout: Duration,

    /// TCP listen address; empty disables the TCP transport.
    pub tcp_addr: String,
    /// TCP length-prefix width in bytes.
    pub len_msg_len: usize,
    /// TCP length-prefix byte order.
    pub little_endian: bool,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            max_conn_num: 0,
            pending_write_num: 0,
            max_msg_len: 0,
            processor: None,
            agent_chan_rpc: None,
            ws_addr: String::new(),
            http_timeout: Duration::ZERO,
            tcp_addr: String::new(),
            len_msg_len: 0,
            little_endian: false,
        }
    }
}

#[async_trait]
impl Module for Gate {
    fn on_init(&mut self) {}

    async fn run(&mut self, close_sig: &mut CloseSig) {
        let processor = self.processor.clone();
        let agent_rpc = self.agent_chan_rpc.clone();

        let mut ws_server = if !self.ws_addr.is_empty() {
            let processor = processor.clone();
            let agent_rpc = agent_rpc.clone();
            let factory: NewWsAgent = Arc::new(move |conn: WsConn| {
                new_gate_agent(Arc::new(conn), processor.clone(), agent_rpc.clone())
            });
            let mut server = WsServer::new(self.ws_addr.clone(), factory);
            server.max_conn_num = self.max_conn_num;
            server.pending_write_num = self.pending_write_num;
            server.max_msg_len = self.max_msg_len;
            server.http_timeout = self.http_timeout;
            Some(server)
        } else {
            None
        };

        let mut tcp_server = if !self.tcp_addr.is_empty() {
            let processor = processor.clone();
            let agent_rpc = agent_rpc.clone();
            let factory: NewTcpAgent = Arc::new(move |conn: TcpConn| {
                new_gate_agent(Arc::new(conn), processor.clone(), agent_rpc.clone())
            });
            let mut server = TcpServer::new(self.tcp_addr.clone(), factory);
            server.max_conn_num = self.max_conn_num;
            server.pending_write_num = self.pending_write_num;
            server.len_msg_len = self.len_msg_len;
            server.max_msg_len = self.max_msg_len;
            server.little_endian = self.little_endian;
            Some(server)
        } else {
            None
        };

        if let Some(server) = &mut ws_server {
            server.start().await;
        }
        if let Some(server) = &mut tcp_server {
            server.start().await;
        }

        close_sig.recv().await;

        if let Some(server) = &mut ws_server {
            server.close().await;
        }
        if let Some(server) = &mut tcp_server {
            server.close().await;
        }
    }

    fn on_destroy(&mut self) {}
}

fn new_gate_agent(
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    agent_rpc: Option<ServerHandle>,
) -> Box<dyn crate::network::Agent> {
    let agent = Agent {
        inner: Arc::new(AgentInner {
            conn,
            processor,
            agent_rpc,
            user_data: Mutex::new(None),
        }),
    };
    if let Some(rpc) = &agent.inner.agent_rpc {
        rpc.go("NewAgent", vec![Arc::new(agent.clone()) as Value]);
    }
    Box::new(GateAgent { agent })
}

struct AgentInner {
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    agent_rpc: Option<ServerHandle>,
    user_data: Mutex<Option<Value>>,
}

/// Per-connection handle passed to handlers and routed calls as the
/// message's user data. Cloneable; the core never interprets the user-data
/// slot.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Encode a message through the gate's processor and enqueue it on the
    /// connection. Encoding failures are logged, not returned, so logic
    /// code can fire and forget.
    pub fn write_msg(&self, msg: Value) {
        let Some(processor) = &self.inner.processor else {
            return;
        };
        match processor.marshal(&msg) {
            Ok(chunks) => {
                let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
                if let Err(e) = self.inner.conn.write_msg(&refs) {
                    error!("write message error: {}", e);
                }
            }
            Err(e) => error!("marshal message error: {}", e),
        }
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.conn.local_addr()
    }

    /// Remote address of the connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.conn.remote_addr()
    }

    /// Gracefully close the connection.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    /// Immediately tear the connection down.
    pub fn destroy(&self) {
        self.inner.conn.destroy();
    }

    /// The opaque user-data slot.
    pub fn user_data(&self) -> Option<Value> {
        self.inner.user_data.lock().expect("user data poisoned").clone()
    }

    /// Replace the opaque user-data slot.
    pub fn set_user_data(&self, data: Option<Value>) {
        *self.inner.user_data.lock().expect("user data poisoned") = data;
    }
}

/// The read-loop driver owning the gate agent's lifecycle.
struct GateAgent {
    agent: Agent,
}

#[async_trait]
impl crate::network::Agent for GateAgent {
    async fn run(&mut self) {
        loop {
            let data = match self.agent.inner.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("read message: {}", e);
                    break;
                }
            };

            let Some(processor) = &self.agent.inner.processor else {
                continue;
            };
            let msg = match processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("unmarshal message error: {}", e);
                    break;
                }
            };
            let user_data: Value = Arc::new(self.agent.clone());
            if let Err(e) = processor.route(msg, user_data) {
                debug!("route message error: {}", e);
                break;
            }
        }
    }

    async fn on_close(&mut self) {
        if let Some(rpc) = &self.agent.inner.agent_rpc {
            let mut client = rpc.open(0);
            let arg: Value = Arc::new(self.agent.clone());
            if let Err(e) = client.call0("CloseAgent", vec![arg]).await {
                error!("chanrpc error: {}", e);
            }
        }
    }
}
