//! # volley
//!
//! Core runtime of a message-oriented game/service server framework.
//!
//! Many concurrent long-lived client connections come in over TCP or
//! WebSocket; framed binary messages are decoded and dispatched into
//! single-threaded user-logic workers while I/O stays fully parallel.
//!
//! ## Architecture
//!
//! - **Gate** ([`gate`]): acceptors + framing + processor, one agent per
//!   connection
//! - **Channel RPC** ([`chanrpc`]): bounded call channel between I/O tasks
//!   and logic workers, sync and async clients
//! - **Offload** ([`go`]): detached work with callbacks funneled back to
//!   the owning task; linear contexts for causally ordered work
//! - **Modules** ([`module`]): ordered init/run, reverse-order shutdown
//!
//! ## Example
//!
//! ```ignore
//! use volley::gate::Gate;
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = Gate {
//!         tcp_addr: "0.0.0.0:8000".to_string(),
//!         max_conn_num: 2000,
//!         processor: Some(processor()),
//!         agent_chan_rpc: Some(game_server_handle()),
//!         ..Gate::default()
//!     };
//!     volley::run(vec![Box::new(game_module()), Box::new(gate)]).await;
//! }
//! ```

pub mod chanrpc;
pub mod conf;
pub mod cronexpr;
pub mod error;
pub mod gate;
pub mod go;
pub mod log;
pub mod module;
pub mod network;
pub mod recordfile;
pub mod timer;

pub use error::{Error, Result};

use tracing::info;

/// Bring a server up: install the logger, init and start the registered
/// modules, wait for an interrupt, then destroy modules in reverse order.
pub async fn run(mods: Vec<Box<dyn module::Module>>) {
    log::init();
    info!("volley {} starting up", env!("CARGO_PKG_VERSION"));

    let running = module::init(mods);

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("volley closing down (signal: interrupt)"),
        Err(e) => info!("volley closing down (signal wait failed: {})", e),
    }

    running.destroy().await;
}
