//! Outbound TCP dialer.
//!
//! Dials `conn_num` connections to one address, retrying on an interval
//! until each connect succeeds or the client is closed. Established
//! connections get the same [`TcpConn`] machinery and agent lifecycle as
//! accepted ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::conn::Conn;
use super::msg_codec::MsgCodec;
use super::tcp_conn::TcpConn;
use super::tcp_server::NewAgent;

type ConnSet = Arc<Mutex<HashMap<u64, TcpConn>>>;

/// A configured or running TCP client.
pub struct TcpClient {
    /// Remote address.
    pub addr: String,
    /// Number of parallel connections; zero resets to 1 on start.
    pub conn_num: usize,
    /// Redial interval; zero resets to 3s on start.
    pub connect_interval: Duration,
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
    close_flag: Arc<AtomicBool>,
    conns: ConnSet,
    done_rx: mpsc::Receiver<()>,
}

impl TcpClient {
    /// Configure a client; capacity and framing fields may be adjusted
    /// before [`start`].
    ///
    /// [`start`]: TcpClient::start
    pub fn new(addr: impl Into<String>, new_agent: NewAgent) -> Self {
        Self {
            addr: addr.into(),
            conn_num: 0,
            connect_interval: Duration::ZERO,
            pending_write_num: 0,
            len_msg_len: 0,
            min_msg_len: 0,
            max_msg_len: 0,
            little_endian: false,
            new_agent,
            state: None,
        }
    }

    /// Start dialing.
    ///
    /// # Panics
    ///
    /// Starting an already-running client is a fatal programmer error.
    pub fn start(&mut self) {
        if self.state.is_some() {
            panic!("client is running");
        }
        if self.conn_num == 0 {
            self.conn_num = 1;
            info!("invalid conn_num, reset to {}", self.conn_num);
        }
        if self.connect_interval.is_zero() {
            self.connect_interval = Duration::from_secs(3);
            info!("invalid connect_interval, reset to {:?}", self.connect_interval);
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = 100;
            info!("invalid pending_write_num, reset to {}", self.pending_write_num);
        }

        let mut codec = MsgCodec::new();
        codec.set_msg_len(self.len_msg_len, self.min_msg_len, self.max_msg_len);
        codec.set_byte_order(self.little_endian);
        let codec = Arc::new(codec);

        let close_flag = Arc::new(AtomicBool::new(false));
        let conns: ConnSet = Arc::new(Mutex::new(HashMap::new()));
        let (done_tx, done_rx) = mpsc::channel(1);

        for id in 0..self.conn_num as u64 {
            tokio::spawn(connect(
                self.addr.clone(),
                self.connect_interval,
                self.pending_write_num,
                codec.clone(),
                self.new_agent.clone(),
                close_flag.clone(),
                conns.clone(),
                id,
                done_tx.clone(),
            ));
        }

        self.state = Some(RunState {
            close_flag,
            conns,
            done_rx,
        });
    }

    /// Stop dialing, close live connections, wait for their tasks.
    pub async fn close(&mut self) {
        let Some(state) = self.state.take() else { return };

        state.close_flag.store(true, Ordering::Release);
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
async fn connect(
    addr: String,
    interval: Duration,
    pending_write_num: usize,
    codec: Arc<MsgCodec>,
    new_agent: NewAgent,
    close_flag: Arc<AtomicBool>,
    conns: ConnSet,
    id: u64,
    done_tx: mpsc::Sender<()>,
) {
    let stream = loop {
        if close_flag.load(Ordering::Acquire) {
            return;
        }
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(e) => {
                info!("connect to {} error: {}", addr, e);
                tokio::time::sleep(interval).await;
            }
        }
    };

    if close_flag.load(Ordering::Acquire) {
        return;
    }

    let conn = match TcpConn::new(stream, pending_write_num, codec) {
        Ok(c) => c,
        Err(e) => {
            debug!("wrap connection: {}", e);
            return;
        }
    };
    conns
        .lock()
        .expect("conn set poisoned")
        .insert(id, conn.clone());

    let mut agent = (new_agent)(conn.clone());
    agent.run().await;

    conn.close();
    conns.lock().expect("conn set poisoned").remove(&id);
    agent.on_close().await;
    drop(done_tx);
}
