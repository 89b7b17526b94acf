//! Connection and agent contracts shared by every transport.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

/// One duplex message stream. Reads are async; writes enqueue onto the
/// connection's bounded send queue and never block.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read one complete message.
    async fn read_msg(&self) -> Result<Vec<u8>>;

    /// Send one message assembled from `chunks`.
    fn write_msg(&self, chunks: &[&[u8]]) -> Result<()>;

    /// Local address.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote (client) address.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Graceful close: queued messages are flushed first.
    fn close(&self);

    /// Immediate teardown: queued messages are discarded.
    fn destroy(&self);
}

/// Per-connection driver. `run` owns the read loop; the acceptor tears the
/// connection down when it returns.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Read-and-dispatch loop; returns on the first connection error.
    async fn run(&mut self);

    /// Called after `run` returns, before the connection is released.
    async fn on_close(&mut self);
}
