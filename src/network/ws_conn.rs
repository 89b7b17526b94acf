//! WebSocket connection.
//!
//! The transport frames for us: one application message per WS binary
//! frame, no length prefix. The send queue, sentinel and drop-and-close
//! discipline are identical to the TCP side; `max_msg_len` is enforced on
//! write (the read limit is enforced by the acceptor's upgrade settings).
//! The writer task flushes, closes the socket and flags the connection
//! done, which unblocks any pending read.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::conn::Conn;
use crate::error::{Error, Result};

/// Cheaply cloneable handle over one WebSocket connection.
#[derive(Clone)]
pub struct WsConn {
    inner: Arc<Inner>,
}

struct Inner {
    reader: tokio::sync::Mutex<SplitStream<WebSocket>>,
    write_tx: mpsc::Sender<Option<Bytes>>,
    closed: Arc<Mutex<bool>>,
    destroy_tx: watch::Sender<bool>,
    destroy_rx: watch::Receiver<bool>,
    writer_done_rx: watch::Receiver<bool>,
    max_msg_len: u32,
    peer_addr: Option<SocketAddr>,
}

impl WsConn {
    /// Wrap an upgraded socket and start its writer task.
    pub fn new(
        socket: WebSocket,
        pending_write_num: usize,
        max_msg_len: u32,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let (sink, stream) = socket.split();
        let (write_tx, write_rx) = mpsc::channel(pending_write_num.max(1));
        let (destroy_tx, destroy_rx) = watch::channel(false);
        let (writer_done_tx, writer_done_rx) = watch::channel(false);
        let closed = Arc::new(Mutex::new(false));

        tokio::spawn(writer_loop(
            write_rx,
            sink,
            destroy_rx.clone(),
            writer_done_tx,
            closed.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                reader: tokio::sync::Mutex::new(stream),
                write_tx,
                closed,
                destroy_tx,
                destroy_rx,
                writer_done_rx,
                max_msg_len,
                peer_addr,
            }),
        }
    }

    /// Whether close or destroy has run.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock().expect("conn state poisoned")
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
        let _ = self.inner.destroy_tx.send(true);
        **closed = true;
    }
}

#[async_trait]
impl Conn for WsConn {
    async fn read_msg(&self) -> Result<Vec<u8>> {
        let mut reader = self.inner.reader.lock().await;
        let mut destroy_rx = self.inner.destroy_rx.clone();
        let mut writer_done_rx = self.inner.writer_done_rx.clone();
        if *destroy_rx.borrow_and_update() || *writer_done_rx.borrow_and_update() {
            return Err(Error::ConnClosed);
        }

        loop {
            let msg = tokio::select! {
                biased;
                _ = destroy_rx.changed() => return Err(Error::ConnClosed),
                _ = writer_done_rx.changed() => return Err(Error::ConnClosed),
                msg = reader.next() => msg,
            };
            match msg {
                None => {
                    return Err(Error::Io(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )))
                }
                Some(Err(e)) => return Err(Error::Protocol(e.to_string())),
                Some(Ok(Message::Binary(b))) => return Ok(b),
                Some(Ok(Message::Close(_))) => return Err(Error::ConnClosed),
                // Text, ping and pong frames are not application messages.
                Some(Ok(_)) => continue,
            }
        }
    }

    fn write_msg(&self, chunks: &[&[u8]]) -> Result<()> {
        let mut closed = self.inner.closed.lock().expect("conn state poisoned");
        if *closed {
            return Ok(());
        }

        let msg_len: u32 = chunks.iter().map(|c| c.len() as u32).sum();
        if msg_len > self.inner.max_msg_len {
            return Err(Error::MsgTooLong);
        }
        if msg_len < 1 {
            return Err(Error::MsgTooShort);
        }

        let body = if chunks.len() == 1 {
            Bytes::copy_from_slice(chunks[0])
        } else {
            let mut buf = BytesMut::with_capacity(msg_len as usize);
            for chunk in chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        };
        self.do_write(body, &mut closed);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
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

async fn writer_loop(
    mut rx: mpsc::Receiver<Option<Bytes>>,
    mut sink: SplitSink<WebSocket, Message>,
    mut destroy_rx: watch::Receiver<bool>,
    writer_done_tx: watch::Sender<bool>,
    closed: Arc<Mutex<bool>>,
) {
    let graceful = loop {
        tokio::select! {
            biased;
            changed = destroy_rx.changed() => {
                match changed {
                    Ok(()) => break false,
                    // Every handle gone: flush what is queued, then stop.
                    Err(_) => break true,
                }
            }
            item = rx.recv() => match item {
                None => break true,
                Some(None) => break false,
                Some(Some(b)) => {
                    if sink.send(Message::Binary(b.to_vec())).await.is_err() {
                        break false;
                    }
                }
            }
        }
    };

    if graceful {
        while let Ok(Some(b)) = rx.try_recv() {
            if sink.send(Message::Binary(b.to_vec())).await.is_err() {
                break;
            }
        }
    }
    let _ = sink.close().await;
    *closed.lock().expect("conn state poisoned") = true;
    let _ = writer_done_tx.send(true);
}
