//! End-to-end scenarios: a gate serving real sockets, wired to processors
//! and channel-RPC logic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use volley::chanrpc::{value, Callback, Function, Server};
use volley::gate::{Agent, Gate};
use volley::go::Go;
use volley::module;
use volley::network::protobuf;

#[derive(Clone, PartialEq, prost::Message)]
struct Echo {
    #[prost(string, tag = "1")]
    text: String,
}

async fn free_port() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn connect_with_retry(addr: std::net::SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {} did not come up", addr);
}

/// A processor that echoes every `Echo` message back to its sender.
fn echo_processor() -> Arc<protobuf::Processor> {
    let mut p = protobuf::Processor::new();
    p.register::<Echo>();
    p.set_handler::<Echo>(|args| {
        let msg = args[0].clone();
        let agent = args[1].downcast_ref::<Agent>().unwrap();
        agent.write_msg(msg);
    });
    Arc::new(p)
}

fn echo_gate(addr: std::net::SocketAddr) -> Gate {
    Gate {
        tcp_addr: addr.to_string(),
        len_msg_len: 2,
        max_msg_len: 16,
        processor: Some(echo_processor()),
        ..Gate::default()
    }
}

/// `<u16 id 0><Echo{text:"hi"}>` behind a 2-byte big-endian length prefix.
fn framed_echo_hi() -> Vec<u8> {
    let mut payload = vec![0x00, 0x00];
    payload.extend(Echo { text: "hi".to_string() }.encode_to_vec());
    let mut frame = vec![0x00, payload.len() as u8];
    frame.extend(&payload);
    frame
}

#[tokio::test]
async fn test_tcp_echo() {
    let addr = free_port().await;
    let running = module::init(vec![Box::new(echo_gate(addr))]);

    let mut client = connect_with_retry(addr).await;
    let frame = framed_echo_hi();
    client.write_all(&frame).await.unwrap();

    let mut reply = vec![0u8; frame.len()];
    tokio::time::timeout(Duration::from_secs(1), client.read_exact(&mut reply))
        .await
        .expect("no reply within 1s")
        .unwrap();
    assert_eq!(reply, frame, "reply must be byte-exact");

    running.destroy().await;
}

#[tokio::test]
async fn test_overlong_message_disconnects() {
    let addr = free_port().await;
    let running = module::init(vec![Box::new(echo_gate(addr))]);

    let mut client = connect_with_retry(addr).await;
    // A frame claiming 17 bytes against max_msg_len = 16.
    client.write_all(&[0x00, 0x11]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .expect("server must hang up")
        .unwrap_or(0);
    assert_eq!(n, 0, "client must see EOF");

    running.destroy().await;
}

#[tokio::test]
async fn test_connection_cap() {
    let addr = free_port().await;
    let mut gate = echo_gate(addr);
    gate.max_conn_num = 2;
    let running = module::init(vec![Box::new(gate)]);

    let mut c1 = connect_with_retry(addr).await;
    let mut c2 = TcpStream::connect(addr).await.unwrap();

    let frame = framed_echo_hi();
    for c in [&mut c1, &mut c2] {
        c.write_all(&frame).await.unwrap();
        let mut reply = vec![0u8; frame.len()];
        c.read_exact(&mut reply).await.unwrap();
    }

    let mut c3 = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(1), c3.read(&mut buf))
        .await
        .expect("third connection must be closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "third connection must be closed immediately");

    // The first two remain functional.
    c1.write_all(&frame).await.unwrap();
    let mut reply = vec![0u8; frame.len()];
    c1.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, frame);

    running.destroy().await;
}

#[tokio::test]
async fn test_ws_echo() {
    let addr = free_port().await;
    let mut gate = echo_gate(addr);
    gate.tcp_addr = String::new();
    gate.ws_addr = addr.to_string();
    let running = module::init(vec![Box::new(gate)]);

    let url = format!("ws://{}/", addr);
    let mut ws = None;
    for _ in 0..100 {
        if let Ok((socket, _)) = tokio_tungstenite::connect_async(url.as_str()).await {
            ws = Some(socket);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut ws = ws.expect("ws server did not come up");

    // No length prefix on the WS wire; the transport frames.
    let mut payload = vec![0x00, 0x00];
    payload.extend(Echo { text: "hi".to_string() }.encode_to_vec());
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(
        payload.clone(),
    ))
    .await
    .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .expect("no reply within 1s")
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_data(), payload);

    running.destroy().await;
}

#[tokio::test]
async fn test_agent_lifecycle_rpc() {
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = Server::new(16);
    let slot = events.clone();
    server.register(
        "NewAgent",
        Function::no_ret(move |args| {
            assert!(args[0].downcast_ref::<Agent>().is_some());
            slot.lock().unwrap().push("new");
        }),
    );
    let slot = events.clone();
    server.register(
        "CloseAgent",
        Function::no_ret(move |args| {
            assert!(args[0].downcast_ref::<Agent>().is_some());
            slot.lock().unwrap().push("close");
        }),
    );
    let handle = server.handle();
    tokio::spawn(async move {
        while let Some(ci) = server.recv().await {
            server.exec(ci).await;
        }
    });

    let addr = free_port().await;
    let mut gate = echo_gate(addr);
    gate.agent_chan_rpc = Some(handle);
    let running = module::init(vec![Box::new(gate)]);

    let client = connect_with_retry(addr).await;
    for _ in 0..100 {
        if events.lock().unwrap().contains(&"new") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(events.lock().unwrap().contains(&"new"));

    drop(client);
    for _ in 0..100 {
        if events.lock().unwrap().contains(&"close") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.lock().unwrap().as_slice(), ["new", "close"]);

    running.destroy().await;
}

#[tokio::test]
async fn test_sync_rpc_shapes() {
    let mut server = Server::new(10);
    server.register(
        "add",
        Function::one_ret(|args| {
            let a = args[0].downcast_ref::<i32>().copied().unwrap();
            let b = args[1].downcast_ref::<i32>().copied().unwrap();
            value(a + b)
        }),
    );
    let mut client = server.open(10);
    tokio::spawn(async move {
        while let Some(ci) = server.recv().await {
            server.exec(ci).await;
        }
    });

    let sum = client
        .call1("add", vec![value(3i32), value(4i32)])
        .await
        .unwrap();
    assert_eq!(sum.downcast_ref::<i32>(), Some(&7));

    // Wrong expected arity never reaches the function.
    let err = client
        .call0("add", vec![value(3i32), value(4i32)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("return type mismatch"));
}

#[tokio::test]
async fn test_async_rpc_full_channel() {
    // Call-channel capacity 1 and nothing draining it.
    let mut server = Server::new(1);
    server.register("noop", Function::no_ret(|_| {}));
    let mut client = server.open(10);

    client.asyn_call("noop", vec![], Callback::no_ret(|_| {}));

    let second = Arc::new(Mutex::new(None));
    let slot = second.clone();
    client.asyn_call(
        "noop",
        vec![],
        Callback::no_ret(move |r| {
            *slot.lock().unwrap() = Some(r.unwrap_err().to_string());
        }),
    );

    assert_eq!(
        second.lock().unwrap().as_deref(),
        Some("chanrpc channel full"),
        "second callback must fire synchronously"
    );
    assert_eq!(client.pending_asyn_call(), 1);
}

#[tokio::test]
async fn test_linear_context_vs_plain_engine() {
    let mut engine = Go::new(16);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ctx = engine.new_linear_context();
    let o1 = order.clone();
    ctx.go(
        move || {
            std::thread::sleep(Duration::from_millis(50));
            o1.lock().unwrap().push("1");
        },
        || {},
    );
    let o2 = order.clone();
    ctx.go(
        move || {
            o2.lock().unwrap().push("2");
        },
        || {},
    );
    engine.close().await;
    assert_eq!(order.lock().unwrap().as_slice(), ["1", "2"]);

    // The plain engine promises completion, not order.
    let mut engine = Go::new(16);
    let ran: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let r1 = ran.clone();
    engine.go(
        move || {
            std::thread::sleep(Duration::from_millis(20));
            r1.lock().unwrap().push("slow");
        },
        || {},
    );
    let r2 = ran.clone();
    engine.go(
        move || {
            r2.lock().unwrap().push("fast");
        },
        || {},
    );
    engine.close().await;
    let mut got = ran.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, ["fast", "slow"]);
}
