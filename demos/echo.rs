//! Framed-TCP echo server assembled from the framework pieces: one logic
//! module servicing a channel-RPC server, and a gate routing decoded
//! messages into it.
//!
//! ```sh
//! cargo run --example echo
//! printf '\x00\x06\x00\x00\x0a\x02hi' | nc 127.0.0.1 8765 | xxd
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use volley::chanrpc::{CallId, Function, Server};
use volley::gate::{Agent, Gate};
use volley::module::{CloseSig, Module};
use volley::network::protobuf;

#[derive(Clone, PartialEq, prost::Message)]
struct Echo {
    #[prost(string, tag = "1")]
    text: String,
}

/// The single-threaded logic worker.
struct Game {
    server: Server,
}

#[async_trait]
impl Module for Game {
    fn on_init(&mut self) {}

    async fn run(&mut self, close_sig: &mut CloseSig) {
        loop {
            tokio::select! {
                biased;
                _ = close_sig.recv() => break,
                ci = self.server.recv() => match ci {
                    Some(ci) => self.server.exec(ci).await,
                    None => break,
                }
            }
        }
        self.server.close().await;
    }

    fn on_destroy(&mut self) {}
}

#[tokio::main]
async fn main() {
    let mut game = Game {
        server: Server::new(64),
    };
    game.server.register(
        CallId::of::<Echo>(),
        Function::no_ret(|args| {
            let msg = args[0].clone();
            let agent = args[1].downcast_ref::<Agent>().unwrap();
            agent.write_msg(msg);
        }),
    );

    let mut processor = protobuf::Processor::new();
    processor.register::<Echo>();
    processor.set_router::<Echo>(game.server.handle());

    let gate = Gate {
        tcp_addr: "127.0.0.1:8765".to_string(),
        max_conn_num: 1024,
        processor: Some(Arc::new(processor)),
        ..Gate::default()
    };

    volley::run(vec![Box::new(game), Box::new(gate)]).await;
}
