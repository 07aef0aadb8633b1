//! Middleware ordering and short-circuit behavior observed from the
//! client side.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use common::{start_server, Client};
use wsrpc::middleware::Next;
use wsrpc::{FrameType, QosLevel, ReliableOptions};

#[tokio::test]
async fn short_circuit_reaches_the_client_as_middleware_error() {
    let server = start_server(ReliableOptions::with_level(QosLevel::None)).await;
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let handled = Arc::new(AtomicUsize::new(0));

    let order_a = Arc::clone(&order);
    server.app.use_middleware(Arc::new(move |_s, _m, payload, next: Next<'_>| {
        order_a.lock().unwrap().push("gA");
        next.call(payload);
    }));
    let order_b = Arc::clone(&order);
    server.app.use_middleware(Arc::new(move |_s, _m, _payload, _next: Next<'_>| {
        order_b.lock().unwrap().push("gB");
        // no next: deny
    }));
    let order_s = Arc::clone(&order);
    server.app.use_for("m", Arc::new(move |_s, _m, payload, next: Next<'_>| {
        order_s.lock().unwrap().push("sA");
        next.call(payload);
    }));
    let handled_in = Arc::clone(&handled);
    server.app.register_rpc(
        "m",
        Arc::new(move |_payload, _ctx| {
            let handled = Arc::clone(&handled_in);
            Box::pin(async move {
                handled.fetch_add(1, Ordering::SeqCst);
            })
        }),
    );

    let mut client = Client::connect(server.addr, "alice", None).await;
    client.send_frame(FrameType::Data, 1, b"m:payload").await;

    assert_eq!(client.recv_frame().await.0, FrameType::Ack);
    let (frame_type, _, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FrameType::Data);
    let text = String::from_utf8(payload).unwrap();
    assert!(text.starts_with("error:2:"), "got {text}");

    assert_eq!(*order.lock().unwrap(), vec!["gA", "gB"]);
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    client.close().await;
    server.app.stop().await;
}

#[tokio::test]
async fn middleware_may_rewrite_the_payload_before_the_handler() {
    let server = start_server(ReliableOptions::with_level(QosLevel::None)).await;
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    server
        .app
        .use_for("tag", Arc::new(|_s, _m, payload: &mut Vec<u8>, next: Next<'_>| {
            payload.extend_from_slice(b"+mw");
            next.call(payload);
        }));
    let seen_in = Arc::clone(&seen);
    server.app.register_rpc(
        "tag",
        Arc::new(move |payload, _ctx| {
            let seen = Arc::clone(&seen_in);
            Box::pin(async move {
                seen.lock().unwrap().push(payload);
            })
        }),
    );

    let mut client = Client::connect(server.addr, "alice", None).await;
    client.send_frame(FrameType::Data, 1, b"tag:base").await;
    assert_eq!(client.recv_frame().await.0, FrameType::Ack);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(*seen.lock().unwrap(), vec![b"base+mw".to_vec()]);

    client.close().await;
    server.app.stop().await;
}
