//! WebSocket acceptor.
//!
//! Serves HTTP on the configured address and upgrades GET requests to
//! binary WebSocket connections; any other method gets 405. No origin
//! policy is applied at this layer. The upgrade's read limit enforces
//! `max_msg_len`; the HTTP timeout bounds the handshake and each plain
//! request. Accepted sockets get the same cap, agent and teardown
//! lifecycle as the TCP acceptor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info};

use super::conn::{Agent, Conn};
use super::ws_conn::WsConn;

/// Agent factory invoked for every upgraded connection.
pub type NewAgent = Arc<dyn Fn(WsConn) -> Box<dyn Agent> + Send + Sync>;

/// A running or configured WebSocket server.
pub struct WsServer {
    /// Listen address.
    pub addr: String,
    /// Live-connection cap; zero resets to 100 on start.
    pub max_conn_num: usize,
    /// Per-connection send-queue length; zero resets to 100 on start.
    pub pending_write_num: usize,
    /// Maximum message length; zero resets to 4096 on start.
    pub max_msg_len: u32,
    /// HTTP read/write and handshake timeout; zero resets to 10s on start.
    pub http_timeout: Duration,

    new_agent: NewAgent,
    state: Option<RunState>,
}

struct HandlerState {
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    new_agent: NewAgent,
    conns: Mutex<HashMap<u64, WsConn>>,
    next_id: AtomicU64,
    done_tx: Mutex<Option<mpsc::Sender<()>>>,
}

struct RunState {
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
    handler: Arc<HandlerState>,
    done_rx: mpsc::Receiver<()>,
    local_addr: Option<SocketAddr>,
}

impl WsServer {
    /// Configure a server; capacity and timeout fields may be adjusted
    /// before [`start`].
    ///
    /// [`start`]: WsServer::start
    pub fn new(addr: impl Into<String>, new_agent: NewAgent) -> Self {
        Self {
            addr: addr.into(),
            max_conn_num: 0,
            pending_write_num: 0,
            max_msg_len: 0,
            http_timeout: Duration::ZERO,
            new_agent,
            state: None,
        }
    }

    /// Bind and start serving upgrades.
    ///
    /// # Panics
    ///
    /// Failing to bind is a fatal configuration error.
    pub async fn start(&mut self) {
        if self.max_conn_num == 0 {
            self.max_conn_num = 100;
            info!("invalid max_conn_num, reset to {}", self.max_conn_num);
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = 100;
            info!("invalid pending_write_num, reset to {}", self.pending_write_num);
        }
        if self.max_msg_len == 0 {
            self.max_msg_len = 4096;
            info!("invalid max_msg_len, reset to {}", self.max_msg_len);
        }
        if self.http_timeout.is_zero() {
            self.http_timeout = Duration::from_secs(10);
            info!("invalid http_timeout, reset to {:?}", self.http_timeout);
        }

        let listener = match TcpListener::bind(&self.addr).await {
            Ok(l) => l,
            Err(e) => panic!("listen {}: {}", self.addr, e),
        };
        let local_addr = listener.local_addr().ok();

        let (done_tx, done_rx) = mpsc::channel(1);
        let handler = Arc::new(HandlerState {
            max_conn_num: self.max_conn_num,
            pending_write_num: self.pending_write_num,
            max_msg_len: self.max_msg_len,
            new_agent: self.new_agent.clone(),
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            done_tx: Mutex::new(Some(done_tx)),
        });

        // Any path upgrades; the method router answers non-GET with 405.
        let app = Router::new()
            .fallback_service(get(ws_handler).with_state(handler.clone()))
            .layer(TimeoutLayer::new(self.http_timeout));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                error!("ws serve error: {}", e);
            }
        });

        self.state = Some(RunState {
            shutdown_tx,
            serve_task,
            handler,
            done_rx,
            local_addr,
        });
    }

    /// The bound local address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().and_then(|s| s.local_addr)
    }

    /// Number of live connections.
    pub fn conn_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.handler.conns.lock().expect("conn set poisoned").len())
            .unwrap_or(0)
    }

    /// Stop accepting, close all live connections, wait for every
    /// per-connection task.
    pub async fn close(&mut self) {
        let Some(state) = self.state.take() else { return };

        let _ = state.shutdown_tx.send(true);

        let live: Vec<WsConn> = {
            let mut set = state.handler.conns.lock().expect("conn set poisoned");
            set.drain().map(|(_, c)| c).collect()
        };
        for conn in &live {
            conn.close();
        }
        state
            .handler
            .done_tx
            .lock()
            .expect("conn set poisoned")
            .take();

        let _ = state.serve_task.await;
        let mut done_rx = state.done_rx;
        while done_rx.recv().await.is_some() {}
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<HandlerState>>,
) -> Response {
    ws.max_message_size(state.max_msg_len as usize)
        .on_upgrade(move |socket| handle_socket(state, socket, peer))
}

async fn handle_socket(
    state: Arc<HandlerState>,
    socket: axum::extract::ws::WebSocket,
    peer: SocketAddr,
) {
    // The master sender is taken on close; late upgrades are dropped.
    let done = {
        let guard = state.done_tx.lock().expect("conn set poisoned");
        guard.clone()
    };
    let Some(done) = done else { return };

    if state.conns.lock().expect("conn set poisoned").len() >= state.max_conn_num {
        debug!("too many connections");
        return;
    }

    let conn = WsConn::new(
        socket,
        state.pending_write_num,
        state.max_msg_len,
        Some(peer),
    );
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    state
        .conns
        .lock()
        .expect("conn set poisoned")
        .insert(id, conn.clone());

    let mut agent = (state.new_agent)(conn.clone());
    agent.run().await;

    conn.close();
    state.conns.lock().expect("conn set poisoned").remove(&id);
    agent.on_close().await;
    drop(done);
}
