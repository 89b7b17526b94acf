//! TCP acceptor.
//!
//! Listens, enforces the connection cap, wraps accepted sockets in
//! [`TcpConn`] and drives one [`Agent`] per connection on its own task.
//! Transient accept errors back off exponentially (5ms doubling to 1s).
//! Shutdown stops the accept loop, closes every live connection and waits
//! for all per-connection tasks to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::conn::{Agent, Conn};
use super::msg_codec::MsgCodec;
use super::tcp_conn::TcpConn;

/// Agent factory invoked for every accepted connection.
pub type NewAgent = Arc<dyn Fn(TcpConn) -> Box<dyn Agent> + Send + Sync>;

type ConnSet = Arc<Mutex<HashMap<u64, TcpConn>>>;

/// A running or configured TCP server.
pub struct TcpServer {
    /// Listen address.
    pub addr: String,
    /// Live-connection cap; zero resets to 100 on start.
    pub max_conn_num: usize,
    /// Per-connection send-queue length; zero resets to 100 on start.
    pub pending_write_num: usize,

    /// Length-prefix width in bytes; zero keeps the codec default.
    pub len_msg_len: usize,
    /// Minimum payload length; zero keeps the codec default.
    pub min_msg_len: u32,
    /// Maximum payload length; zero keeps the codec default.
    pub max_msg_len: u32,
    /// Length-prefix byte order.
    pub little_endian: bool,

    new_agent: NewAgent,
    state: Option<RunState>,
}

struct RunState {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    conns: ConnSet,
    done_rx: mpsc::Receiver<()>,
    local_addr: Option<std::net::SocketAddr>,
}

impl TcpServer {
    /// Configure a server; framing and capacity fields may be adjusted
    /// before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(addr: impl Into<String>, new_agent: NewAgent) -> Self {
        Self {
            addr: addr.into(),
            max_conn_num: 0,
            pending_write_num: 0,
            len_msg_len: 0,
            min_msg_len: 0,
            max_msg_len: 0,
            little_endian: false,
            new_agent,
            state: None,
        }
    }

    /// Bind and start accepting.
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

        let listener = match TcpListener::bind(&self.addr).await {
            Ok(l) => l,
            Err(e) => panic!("listen {}: {}", self.addr, e),
        };

        let mut codec = MsgCodec::new();
        codec.set_msg_len(self.len_msg_len, self.min_msg_len, self.max_msg_len);
        codec.set_byte_order(self.little_endian);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(1);
        let conns: ConnSet = Arc::new(Mutex::new(HashMap::new()));
        let local_addr = listener.local_addr().ok();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.max_conn_num,
            self.pending_write_num,
            Arc::new(codec),
            self.new_agent.clone(),
            conns.clone(),
            shutdown_rx,
            done_tx,
        ));

        self.state = Some(RunState {
            shutdown_tx,
            accept_task,
            conns,
            done_rx,
            local_addr,
        });
    }

    /// The bound local address, once started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.state.as_ref().and_then(|s| s.local_addr)
    }

    /// Number of live connections.
    pub fn conn_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.conns.lock().expect("conn set poisoned").len())
            .unwrap_or(0)
    }

    /// Stop accepting, close all live connections, wait for every
    /// per-connection task.
    pub async fn close(&mut self) {
        let Some(state) = self.state.take() else { return };

        let _ = state.shutdown_tx.send(true);
        let _ = state.accept_task.await;

        let live: Vec<TcpConn> = {
            let mut set = state.conns.lock().expect("conn set poisoned");
            set.drain().map(|(_, c)| c).collect()
        };
        for conn in &live {
            conn.close();
        }

        let mut done_rx = state.done_rx;
        while done_rx.recv().await.is_some() {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    max_conn_num: usize,
    pending_write_num: usize,
    codec: Arc<MsgCodec>,
    new_agent: NewAgent,
    conns: ConnSet,
    mut shutdown_rx: watch::Receiver<bool>,
    done_tx: mpsc::Sender<()>,
) {
    let mut next_id: u64 = 0;
    let mut delay = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, _peer) = match accepted {
            Ok(s) => {
                delay = Duration::ZERO;
                s
            }
            Err(e) if is_transient(&e) => {
                delay = if delay.is_zero() {
                    Duration::from_millis(5)
                } else {
                    (delay * 2).min(Duration::from_secs(1))
                };
                warn!("accept error: {}; retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => {
                error!("accept error: {}", e);
                break;
            }
        };

        if conns.lock().expect("conn set poisoned").len() >= max_conn_num {
            debug!("too many connections");
            continue;
        }

        let conn = match TcpConn::new(stream, pending_write_num, codec.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!("wrap connection: {}", e);
                continue;
            }
        };

        let id = next_id;
        next_id += 1;
        conns
            .lock()
            .expect("conn set poisoned")
            .insert(id, conn.clone());

        let mut agent = (new_agent)(conn.clone());
        let conns = conns.clone();
        let done = done_tx.clone();
        tokio::spawn(async move {
            agent.run().await;

            conn.close();
            conns.lock().expect("conn set poisoned").remove(&id);
            agent.on_close().await;
            drop(done);
        });
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}
