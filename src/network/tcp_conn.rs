//! Framed TCP connection with a dedicated writer task.
//!
//! Every connection owns a bounded send queue drained by exactly one writer
//! task, so application tasks never touch the socket and no two writes can
//! interleave. `None` on the queue is the graceful-shutdown sentinel: the
//! writer flushes everything queued before it, then closes the socket.
//!
//! Backpressure policy: a full queue disconnects. `write` logs
//! `close conn: channel full` and destroys the connection instead of
//! blocking the caller — slow consumers are dropped, not throttled.

use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::conn::Conn;
use super::msg_codec::MsgCodec;
use crate::error::Result;

/// Cheaply cloneable handle over one TCP connection.
#[derive(Clone)]
pub struct TcpConn {
    inner: Arc<Inner>,
}

struct Inner {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    write_tx: mpsc::Sender<Option<Bytes>>,
    closed: Arc<Mutex<bool>>,
    destroy_tx: watch::Sender<bool>,
    codec: Arc<MsgCodec>,
    /// Dup of the socket fd: lets close/destroy reach the socket while the
    /// halves live in the reader path and the writer task.
    sock: std::net::TcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpConn {
    /// Wrap an accepted or dialed stream and start its writer task.
    pub fn new(
        stream: TcpStream,
        pending_write_num: usize,
        codec: Arc<MsgCodec>,
    ) -> Result<Self> {
        let std_stream = stream.into_std()?;
        let sock = std_stream.try_clone()?;
        let writer_sock = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(pending_write_num.max(1));
        let (destroy_tx, destroy_rx) = watch::channel(false);
        let closed = Arc::new(Mutex::new(false));

        tokio::spawn(writer_loop(
            write_rx,
            write_half,
            destroy_rx,
            writer_sock,
            closed.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                reader: tokio::sync::Mutex::new(read_half),
                write_tx,
                closed,
                destroy_tx,
                codec,
                sock,
                local_addr,
                peer_addr,
            }),
        })
    }

    /// Whether close or destroy has run.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock().expect("conn state poisoned")
    }

    /// Enqueue raw bytes. A no-op once closed; a full queue triggers
    /// drop-and-close.
    pub fn write(&self, b: Bytes) {
        let mut closed = self.inner.closed.lock().expect("conn state poisoned");
        if *closed || b.is_empty() {
            return;
        }
        self.do_write(b, &mut closed);
    }

    fn do_write(&self, b: Bytes, closed: &mut MutexGuard<'_, bool>) {
        match self.inner.write_tx.try_send(Some(b)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("close conn: channel full");
                self.do_destroy(closed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn do_destroy(&self, closed: &mut MutexGuard<'_, bool>) {
        // Linger 0 discards anything the kernel still buffers.
        let sref = socket2::SockRef::from(&self.inner.sock);
        let _ = sref.set_linger(Some(Duration::ZERO));
        let _ = self.inner.sock.shutdown(Shutdown::Both);
        let _ = self.inner.destroy_tx.send(true);
        **closed = true;
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_msg(&self) -> Result<Vec<u8>> {
        let mut reader = self.inner.reader.lock().await;
        self.inner.codec.read(&mut *reader).await
    }

    fn write_msg(&self, chunks: &[&[u8]]) -> Result<()> {
        let framed = self.inner.codec.frame(chunks)?;
        self.write(framed);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    fn close(&self) {
        let mut closed = self.inner.closed.lock().expect("conn state poisoned");
        if *closed {
            return;
        }
        match self.inner.write_tx.try_send(None) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("close conn: channel full");
                self.do_destroy(&mut closed);
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        *closed = true;
    }

    fn destroy(&self) {
        let mut closed = self.inner.closed.lock().expect("conn state poisoned");
        if *closed {
            return;
        }
        self.do_destroy(&mut closed);
    }
}

enum Exit {
    /// Sentinel, write error or destroy: stop now.
    Now,
    /// Every handle is gone: flush what is already queued, then stop.
    Drain,
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Option<Bytes>>,
    mut writer: OwnedWriteHalf,
    mut destroy_rx: watch::Receiver<bool>,
    sock: std::net::TcpStream,
    closed: Arc<Mutex<bool>>,
) {
    let exit = loop {
        tokio::select! {
            biased;
            changed = destroy_rx.changed() => {
                match changed {
                    Ok(()) => break Exit::Now,
                    Err(_) => break Exit::Drain,
                }
            }
            item = rx.recv() => match item {
                None | Some(None) => break Exit::Now,
                Some(Some(b)) => {
                    if writer.write_all(&b).await.is_err() {
                        break Exit::Now;
                    }
                }
            }
        }
    };

    if let Exit::Drain = exit {
        while let Ok(Some(b)) = rx.try_recv() {
            if writer.write_all(&b).await.is_err() {
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    let _ = sock.shutdown(Shutdown::Both);
    *closed.lock().expect("conn state poisoned") = true;
}
