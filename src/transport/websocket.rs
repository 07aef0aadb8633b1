//! WebSocket transport and reliability engine.
//!
//! Each accepted connection gets a reader task and a writer task. The
//! writer drains a bounded outbound channel, which doubles as the
//! backpressure send queue: a full channel closes the connection with
//! code 1009. The reliability state machine (QoS-1 acknowledgments and
//! retries, the QoS-2 four-way handshake, inbound duplicate detection)
//! runs in the reader and in one transport-wide retry task ticking every
//! 100 ms.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::conn_state::{ConnState, FrameInfo, Qos2Meta, Qos2Stage};
use crate::frame::{decode_frame, encode_frame, FrameType};
use crate::identity::token_to_hex;
use crate::qos::{QosLevel, ReliableOptions};
use crate::session::{ConnectionId, Session, SessionManager, SessionStatus};
use crate::time::now_ms;
use crate::transport::{
    DataCallback, DisconnectCallback, HandshakeInspector, HeaderInspector,
    SessionRegisterCallback, Transport, TransportError,
};

/// Close code sent when a newer connection takes over an identity.
const CLOSE_REPLACED: u16 = 1000;
/// Close code sent when the outbound queue overflows.
const CLOSE_OVERFLOW: u16 = 1009;

/// Interval between retry-scheduler ticks.
const RETRY_TICK: Duration = Duration::from_millis(100);

/// One live WebSocket connection.
pub(crate) struct Connection {
    id: ConnectionId,
    session: Arc<Session>,
    state: Arc<ConnState>,
    outbound: mpsc::Sender<Message>,
    alive: AtomicBool,
    closer: CancellationToken,
    close_reason: Mutex<Option<(u16, String)>>,
}

impl Connection {
    /// Hand a frame to the writer without blocking.
    ///
    /// Success means the frame was written or queued; a full queue closes
    /// the connection and reports failure.
    fn safe_send(&self, frame: Vec<u8>) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        match self.outbound.try_send(Message::Binary(frame.into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::error!(conn = %self.id, "send queue overflow; closing connection");
                self.close(CLOSE_OVERFLOW, "send queue overflow");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request the connection be closed with the given code and reason.
    /// The first reason wins; later calls only re-signal the closer.
    fn close(&self, code: u16, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some((code, reason.to_string()));
            }
        }
        self.closer.cancel();
    }
}

struct Inner {
    manager: Arc<SessionManager>,
    opts: RwLock<ReliableOptions>,
    inspector: RwLock<Arc<dyn HandshakeInspector>>,
    conns: DashMap<ConnectionId, Arc<Connection>>,
    next_conn_id: AtomicU64,
    data_cb: RwLock<Option<DataCallback>>,
    register_cb: RwLock<Option<SessionRegisterCallback>>,
    disconnect_cb: RwLock<Option<DisconnectCallback>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// Server transport over `tokio-tungstenite`.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    /// Create a transport bound to a session manager.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, opts: ReliableOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                opts: RwLock::new(opts),
                inspector: RwLock::new(Arc::new(HeaderInspector)),
                conns: DashMap::new(),
                next_conn_id: AtomicU64::new(1),
                data_cb: RwLock::new(None),
                register_cb: RwLock::new(None),
                disconnect_cb: RwLock::new(None),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: AtomicBool::new(false),
                local_addr: RwLock::new(None),
            }),
        }
    }

    /// Replace the handshake inspector.
    pub fn set_inspector(&self, inspector: Arc<dyn HandshakeInspector>) {
        *self.inner.inspector.write() = inspector;
    }

    /// Replace the reliability options.
    ///
    /// Changing the QoS level, base retry, or retry cap invalidates
    /// in-flight delivery state, so every live connection's buffers are
    /// cleared in that case.
    pub fn set_reliable(&self, opts: ReliableOptions) {
        let reset = {
            let current = self.inner.opts.read();
            current.level != opts.level
                || current.base_retry_ms != opts.base_retry_ms
                || current.max_retry != opts.max_retry
        };
        if reset {
            for conn in self.inner.conns.iter() {
                conn.state.clear();
            }
        }
        *self.inner.opts.write() = opts;
    }

    /// Snapshot of the current reliability options.
    #[must_use]
    pub fn options(&self) -> ReliableOptions {
        self.inner.opts.read().clone()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    /// The address the listener bound to, once started. Useful with
    /// port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self, port: u16) -> Result<(), TransportError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRunning);
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound = listener.local_addr()?;
        *self.inner.local_addr.write() = Some(bound);
        tracing::info!(%bound, "websocket transport listening");

        self.inner
            .manager
            .spawn_maintenance(self.inner.shutdown.clone());

        let retry_inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(retry_loop(retry_inner));

        let accept_inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(accept_loop(accept_inner, listener));
        Ok(())
    }

    async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn broadcast(&self, data: &[u8]) {
        for conn in self.inner.conns.iter() {
            send_frame(&self.inner, &conn, data);
        }
    }

    fn send_to_client(&self, conn: ConnectionId, data: &[u8]) {
        if let Some(conn) = self.inner.conns.get(&conn) {
            send_frame(&self.inner, &conn, data);
        }
    }

    fn send_to_session(&self, session: &Arc<Session>, data: &[u8]) {
        if session.status() == SessionStatus::Offline {
            if !self.inner.manager.add_offline_message(session.id(), data.to_vec()) {
                tracing::warn!(sid = %session.id(), "offline queue refused message");
            }
            return;
        }

        let target = session
            .live_conn()
            .and_then(|id| self.inner.conns.get(&id).map(|c| Arc::clone(&c)));
        match target {
            Some(conn) if conn.alive.load(Ordering::Acquire) => {
                send_frame(&self.inner, &conn, data);
            }
            _ => {
                // The bound connection is gone; fall back to the offline
                // queue after dropping the stale binding.
                session.rebind(None);
                if !self.inner.manager.add_offline_message(session.id(), data.to_vec()) {
                    tracing::warn!(sid = %session.id(), "offline queue refused message");
                }
            }
        }
    }

    fn disconnect_client(&self, conn: ConnectionId) {
        if let Some(conn) = self.inner.conns.get(&conn) {
            conn.close(CLOSE_REPLACED, "closed by server");
        }
    }

    fn set_data_callback(&self, cb: DataCallback) {
        *self.inner.data_cb.write() = Some(cb);
    }

    fn set_session_register_callback(&self, cb: SessionRegisterCallback) {
        *self.inner.register_cb.write() = Some(cb);
    }

    fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        *self.inner.disconnect_cb.write() = Some(cb);
    }
}

/// Send `payload` to `conn` at the configured QoS level.
fn send_frame(inner: &Inner, conn: &Connection, payload: &[u8]) {
    let level = inner.opts.read().level;
    match level {
        QosLevel::None => send_qos0(conn, payload),
        QosLevel::AtLeastOnce => send_qos1(inner, conn, payload),
        QosLevel::ExactlyOnce => send_qos2(inner, conn, payload),
    }
}

fn send_qos0(conn: &Connection, payload: &[u8]) {
    let id = conn.state.next_id();
    conn.safe_send(encode_frame(FrameType::Data, id, payload));
}

fn send_qos1(inner: &Inner, conn: &Connection, payload: &[u8]) {
    let backoff = inner.opts.read().backoff_strategy();
    let id = conn.state.next_id();
    let frame = encode_frame(FrameType::Data, id, payload);
    let info = FrameInfo {
        frame: frame.clone(),
        retry_count: 0,
        next_retry_at: Instant::now() + backoff.next_delay(1),
    };
    conn.state.pend.write().pending1.insert(id, info);
    tracing::debug!(conn = %conn.id, id, "qos1 frame tracked");
    if !conn.safe_send(frame) {
        tracing::warn!(conn = %conn.id, id, "initial qos1 send failed; retry pending");
    }
}

fn send_qos2(inner: &Inner, conn: &Connection, payload: &[u8]) {
    let backoff = inner.opts.read().backoff_strategy();
    let id = conn.state.next_id();
    let now = Instant::now();

    if conn.state.q2.read().contains_key(&id) {
        tracing::warn!(conn = %conn.id, id, "id already in exactly-once pipeline; refused");
        return;
    }
    {
        let mut pend = conn.state.pend.write();
        if pend.pub_prepare.contains_key(&id) || pend.pending_resp.contains_key(&id) {
            tracing::warn!(conn = %conn.id, id, "id already staged; refused");
            return;
        }
        pend.queued_bytes += payload.len();
        pend.pub_prepare.insert(id, payload.to_vec());
    }

    let meta = Qos2Meta {
        stage: Qos2Stage::Prepare,
        frame: encode_frame(FrameType::Prepare, id, &[]),
        retry_count: 0,
        next_retry_at: now + backoff.next_delay(1),
        last_touched_at: now,
    };
    let frame = meta.frame.clone();
    conn.state.q2.write().insert(id, meta);
    tracing::debug!(conn = %conn.id, id, "qos2 prepare sent");
    if !conn.safe_send(frame) {
        tracing::warn!(conn = %conn.id, id, "initial prepare send failed; retry pending");
    }
}

/// Drive the state machine for one inbound frame.
fn handle_frame(inner: &Inner, conn: &Arc<Connection>, raw: &[u8]) {
    let Some(frame) = decode_frame(raw) else {
        tracing::debug!(conn = %conn.id, len = raw.len(), "ignoring malformed frame");
        return;
    };
    match frame.frame_type {
        FrameType::Ack => handle_ack(conn, frame.id),
        FrameType::Data => handle_data(inner, conn, frame.id, frame.payload),
        FrameType::PrepareAck => handle_prepare_ack(inner, conn, frame.id),
        FrameType::Complete => handle_complete(conn, frame.id),
        FrameType::Prepare | FrameType::Commit => {
            // Subscriber-side exactly-once is not part of this server.
            tracing::debug!(conn = %conn.id, id = frame.id, frame = %frame.frame_type, "unhandled frame type");
        }
    }
}

fn handle_ack(conn: &Connection, id: u64) {
    let mut pend = conn.state.pend.write();
    if pend.pending1.remove(&id).is_none() {
        // May be an ACK for a pre-rebind message still in flight.
        tracing::warn!(conn = %conn.id, id, "ack for unknown message id");
    }
}

fn handle_data(inner: &Inner, conn: &Arc<Connection>, id: u64, payload: &[u8]) {
    // Acknowledge first, best effort; retrying is the peer's job.
    conn.safe_send(encode_frame(FrameType::Ack, id, &[]));

    let ttl = inner.opts.read().duplicate_ttl();
    if !conn.state.register_seen(id, ttl) {
        tracing::debug!(conn = %conn.id, id, "retransmitted id; already dispatched");
        return;
    }
    if !conn.session.accept_duplicate(payload, ttl) {
        tracing::debug!(conn = %conn.id, id, "duplicate payload suppressed");
        return;
    }

    let cb = inner.data_cb.read().clone();
    if let Some(cb) = cb {
        cb(payload.to_vec(), Arc::clone(&conn.session), Some(conn.id));
    } else {
        tracing::error!(conn = %conn.id, "no data callback installed; dropping frame");
    }
}

fn handle_prepare_ack(inner: &Inner, conn: &Connection, id: u64) {
    let backoff = inner.opts.read().backoff_strategy();
    let now = Instant::now();

    let commit_frame = {
        let mut q2 = conn.state.q2.write();
        match q2.get_mut(&id) {
            Some(meta) if meta.stage == Qos2Stage::Prepare => {
                meta.stage = Qos2Stage::Commit;
                meta.frame = encode_frame(FrameType::Commit, id, &[]);
                meta.retry_count = 0;
                meta.next_retry_at = now + backoff.next_delay(1);
                meta.last_touched_at = now;
                Some(meta.frame.clone())
            }
            Some(_) => {
                // Duplicate PREPARE_ACK while committed; idempotent.
                tracing::debug!(conn = %conn.id, id, "duplicate prepare-ack ignored");
                None
            }
            None => {
                tracing::warn!(conn = %conn.id, id, "prepare-ack without matching prepare");
                None
            }
        }
    };
    let Some(commit_frame) = commit_frame else {
        return;
    };

    {
        let mut pend = conn.state.pend.write();
        if let Some(payload) = pend.pub_prepare.remove(&id) {
            pend.pending_resp.insert(id, payload);
        }
    }
    tracing::debug!(conn = %conn.id, id, "qos2 commit sent");
    conn.safe_send(commit_frame);
}

fn handle_complete(conn: &Connection, id: u64) {
    // Duplicate COMPLETE finds nothing to remove and nothing staged.
    conn.state.q2.write().remove(&id);

    let payload = {
        let mut pend = conn.state.pend.write();
        let payload = pend.pending_resp.remove(&id);
        if let Some(p) = &payload {
            pend.queued_bytes = pend.queued_bytes.saturating_sub(p.len());
        }
        payload
    };
    if let Some(payload) = payload {
        tracing::debug!(conn = %conn.id, id, "qos2 complete; delivering data");
        conn.safe_send(encode_frame(FrameType::Data, id, &payload));
    }
}

/// Resend overdue frames for one connection and drop exhausted ones.
fn check_retries(inner: &Inner, conn: &Connection, now: Instant) {
    let opts = inner.opts.read().clone();
    let backoff = opts.backoff_strategy();

    {
        let mut pend = conn.state.pend.write();
        pend.pending1.retain(|id, info| {
            if now < info.next_retry_at {
                return true;
            }
            if opts.max_retry > 0 && info.retry_count >= opts.max_retry {
                tracing::debug!(conn = %conn.id, id, "qos1 retries exhausted; dropping");
                return false;
            }
            if conn.safe_send(info.frame.clone()) {
                info.retry_count += 1;
                info.next_retry_at = now + backoff.next_delay(info.retry_count + 1);
                tracing::debug!(conn = %conn.id, id, attempt = info.retry_count, "qos1 retransmit");
            }
            true
        });
    }

    let mut exhausted = Vec::new();
    {
        let mut q2 = conn.state.q2.write();
        q2.retain(|id, meta| {
            if now < meta.next_retry_at {
                return true;
            }
            if opts.max_retry > 0 && meta.retry_count >= opts.max_retry {
                tracing::debug!(conn = %conn.id, id, "qos2 retries exhausted; dropping");
                exhausted.push(*id);
                return false;
            }
            if conn.safe_send(meta.frame.clone()) {
                meta.retry_count += 1;
                meta.last_touched_at = now;
                meta.next_retry_at = now + backoff.next_delay(meta.retry_count + 1);
                tracing::debug!(
                    conn = %conn.id,
                    id,
                    stage = ?meta.stage,
                    attempt = meta.retry_count,
                    "qos2 retransmit"
                );
            }
            true
        });
    }
    if !exhausted.is_empty() {
        let mut pend = conn.state.pend.write();
        for id in exhausted {
            pend.pub_prepare.remove(&id);
            pend.pending_resp.remove(&id);
        }
    }
}

async fn retry_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = tokio::time::sleep(RETRY_TICK) => {
                let now = Instant::now();
                for conn in inner.conns.iter() {
                    check_retries(&inner, &conn, now);
                }
            }
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut delay = Duration::from_millis(10);
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    delay = Duration::from_millis(10);
                    let inner = Arc::clone(&inner);
                    inner.tracker.clone().spawn(async move {
                        handle_connection(inner, stream).await;
                    });
                    tracing::debug!(%peer, "connection accepted");
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed; backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
            },
        }
    }
}

async fn handle_connection(inner: Arc<Inner>, stream: TcpStream) {
    let inspector = Arc::clone(&*inner.inspector.read());
    let running = inner.running.load(Ordering::Acquire);
    let manager = Arc::clone(&inner.manager);

    let mut accepted: Option<Arc<Session>> = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, mut response: Response| {
        if !running {
            let mut reject = ErrorResponse::new(Some("server stopping".to_string()));
            *reject.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(reject);
        }
        let Some(identity) = inspector.extract(request) else {
            let reason = inspector.reject_reason();
            tracing::warn!(reason, "handshake rejected");
            let mut reject = ErrorResponse::new(Some(reason));
            *reject.status_mut() = StatusCode::BAD_REQUEST;
            return Err(reject);
        };

        let session = manager.get_or_create(&identity, now_ms());
        // Echo the resolved token so the client can present it when it
        // reconnects.
        let token_hex = token_to_hex(&session.identity().session_token);
        if let Ok(value) = HeaderValue::from_str(&token_hex) {
            response.headers_mut().insert("x-session-token", value);
        }
        accepted = Some(session);
        Ok(response)
    })
    .await;

    let ws = match ws {
        Ok(ws) => ws,
        Err(error) => {
            tracing::debug!(%error, "websocket upgrade failed");
            return;
        }
    };
    let Some(session) = accepted else {
        return;
    };

    // A previous connection for the same identity is replaced, closed by
    // its own writer on its own task.
    if let Some(old_id) = session.live_conn() {
        if let Some(old) = inner.conns.get(&old_id) {
            tracing::debug!(conn = %old_id, sid = %session.id(), "closing replaced connection");
            old.close(CLOSE_REPLACED, "connection replaced");
        }
    }

    let opts = inner.opts.read().clone();
    let conn_id = ConnectionId::from(inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
    let (outbound_tx, outbound_rx) = mpsc::channel(opts.max_send_queue_size.max(1));
    let conn = Arc::new(Connection {
        id: conn_id,
        session: Arc::clone(&session),
        state: session.conn_state(),
        outbound: outbound_tx,
        alive: AtomicBool::new(true),
        closer: inner.shutdown.child_token(),
        close_reason: Mutex::new(None),
    });

    inner.conns.insert(conn_id, Arc::clone(&conn));
    session.rebind(Some(conn_id));
    tracing::info!(conn = %conn_id, sid = %session.id(), "connection open");

    {
        let pending = conn.state.pend.read().pending1.len();
        if pending > 0 {
            tracing::debug!(conn = %conn_id, pending, "rebound with frames in flight");
        }
    }

    let register_cb = inner.register_cb.read().clone();
    if let Some(cb) = register_cb {
        cb(session.id(), Arc::clone(&session));
    }

    // Deliver everything queued while the session was offline, through
    // the regular QoS pipeline.
    {
        let inner_ref = &inner;
        let conn_ref = &conn;
        inner
            .manager
            .process_offline_messages(session.id(), |data| {
                send_frame(inner_ref, conn_ref, data);
            });
    }

    let (sink, mut source) = ws.split();
    inner
        .tracker
        .spawn(writer_loop(Arc::clone(&conn), sink, outbound_rx));

    loop {
        tokio::select! {
            () = conn.closer.cancelled() => break,
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => handle_frame(&inner, &conn, &data),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = conn.outbound.try_send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    tracing::debug!(conn = %conn_id, "ignoring non-binary message");
                }
                Some(Err(error)) => {
                    tracing::debug!(conn = %conn_id, %error, "read failed");
                    break;
                }
            },
        }
    }

    teardown_connection(&inner, &conn).await;
}

async fn writer_loop(
    conn: Arc<Connection>,
    mut sink: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    mut outbound: mpsc::Receiver<Message>,
) {
    loop {
        tokio::select! {
            biased;
            () = conn.closer.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(error) = sink.send(msg).await {
                        tracing::debug!(conn = %conn.id, %error, "write failed");
                        conn.closer.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let reason = conn.close_reason.lock().clone();
    if let Some((code, reason)) = reason {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    } else {
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// Unregister a closed connection and move its session offline when no
/// sibling connection remains for the same identity.
async fn teardown_connection(inner: &Arc<Inner>, conn: &Arc<Connection>) {
    conn.alive.store(false, Ordering::Release);
    conn.closer.cancel();
    inner.conns.remove(&conn.id);

    let session = &conn.session;
    let identity_still_connected = inner.conns.iter().any(|other| {
        other.alive.load(Ordering::Acquire) && other.session.identity() == session.identity()
    });

    if !identity_still_connected {
        // Only clear the binding we own; a replacement connection may
        // already have rebound the session.
        if session.live_conn() == Some(conn.id) {
            session.rebind(None);
        }
        let ttl = inner.opts.read().session_ttl_ms;
        session.set_expiry_ms(now_ms() + ttl);
        tracing::info!(conn = %conn.id, sid = %session.id(), "session offline");
    } else {
        tracing::debug!(conn = %conn.id, sid = %session.id(), "identity still connected elsewhere");
    }

    let disconnect_cb = inner.disconnect_cb.read().clone();
    if let Some(cb) = disconnect_cb {
        cb(Arc::clone(session));
    }
}
