//! At-least-once and exactly-once delivery over real connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{start_server, Client, ServerFixture};
use wsrpc::{
    FrameType, LinearBackoff, QosLevel, ReliableOptions, Session, SessionStatus,
    Transport,
};

fn reliable(level: QosLevel) -> ReliableOptions {
    ReliableOptions {
        level,
        max_retry: 3,
        backoff: Some(Arc::new(LinearBackoff::new(
            Duration::from_millis(50),
            Duration::from_millis(500),
        ))),
        duplicate_ttl_ms: 5_000,
        ..ReliableOptions::default()
    }
}

/// Wait until the server side sees exactly one online session, and return
/// it.
async fn online_session(server: &ServerFixture) -> Arc<Session> {
    for _ in 0..100 {
        let manager = server.app.session_manager();
        if let Some(sid) = manager.list_session_ids().first() {
            let session = manager.get_session(sid).expect("session exists");
            if session.status() == SessionStatus::Online {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no session came online");
}

#[tokio::test]
async fn qos1_retransmits_until_acked() {
    let server = start_server(reliable(QosLevel::AtLeastOnce)).await;
    let mut client = Client::connect(server.addr, "alice", None).await;
    let session = online_session(&server).await;

    server.transport.send_to_session(&session, b"job-1");

    let (frame_type, id, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FrameType::Data);
    assert_eq!(payload, b"job-1");

    // Withhold the ACK: the same frame must come around again.
    let (retry_type, retry_id, retry_payload) = client.recv_frame().await;
    assert_eq!((retry_type, retry_id), (FrameType::Data, id));
    assert_eq!(retry_payload, b"job-1");

    client.send_frame(FrameType::Ack, id, &[]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        session.conn_state().pend.read().pending1.is_empty(),
        "ACK should clear the pending table"
    );

    client.close().await;
    server.app.stop().await;
}

#[tokio::test]
async fn qos1_inbound_retransmission_dispatches_once() {
    let server = start_server(reliable(QosLevel::AtLeastOnce)).await;
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let hits_in = Arc::clone(&hits);
    server.app.register_rpc(
        "inc",
        Arc::new(move |_payload, _ctx| {
            let hits = Arc::clone(&hits_in);
            Box::pin(async move {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        }),
    );

    let mut client = Client::connect(server.addr, "alice", None).await;

    // The client retransmits the same id, as it would after a lost ACK.
    client.send_frame(FrameType::Data, 9, b"inc:counter").await;
    assert_eq!(client.recv_frame().await.0, FrameType::Ack);
    client.send_frame(FrameType::Data, 9, b"inc:counter").await;
    assert_eq!(client.recv_frame().await.0, FrameType::Ack);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

    client.close().await;
    server.app.stop().await;
}

#[tokio::test]
async fn qos2_four_way_handshake_delivers_exactly_once() {
    let server = start_server(reliable(QosLevel::ExactlyOnce)).await;
    let mut client = Client::connect(server.addr, "alice", None).await;
    let session = online_session(&server).await;

    server.transport.send_to_session(&session, b"exactly-once");

    let (frame_type, id, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FrameType::Prepare);
    assert!(payload.is_empty());

    client.send_frame(FrameType::PrepareAck, id, &[]).await;
    let (frame_type, commit_id, _) = client.recv_frame().await;
    assert_eq!((frame_type, commit_id), (FrameType::Commit, id));

    client.send_frame(FrameType::Complete, id, &[]).await;
    let (frame_type, data_id, data) = client.recv_frame().await;
    assert_eq!((frame_type, data_id), (FrameType::Data, id));
    assert_eq!(data, b"exactly-once");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = session.conn_state();
    assert!(state.q2.read().is_empty());
    {
        let pend = state.pend.read();
        assert!(pend.pub_prepare.is_empty());
        assert!(pend.pending_resp.is_empty());
    }

    client.close().await;
    server.app.stop().await;
}

#[tokio::test]
async fn qos0_is_untracked_fire_and_forget() {
    let server = start_server(ReliableOptions::with_level(QosLevel::None)).await;
    let mut client = Client::connect(server.addr, "alice", None).await;
    let session = online_session(&server).await;

    server.transport.send_to_session(&session, b"notice");
    let (frame_type, _, payload) = client.recv_frame().await;
    assert_eq!(frame_type, FrameType::Data);
    assert_eq!(payload, b"notice");
    assert!(session.conn_state().pend.read().pending1.is_empty());

    client.close().await;
    server.app.stop().await;
}
