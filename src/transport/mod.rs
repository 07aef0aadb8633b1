//! Transport capability and callback seams.
//!
//! The core is transport-agnostic: it drives whatever implements
//! [`Transport`] through the callbacks below. The WebSocket
//! implementation lives in [`websocket`].

mod handshake;
pub mod websocket;

pub use handshake::{HandshakeInspector, HeaderInspector, UpgradeRequest};
pub use websocket::WebSocketTransport;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{ConnectionId, Session};

/// Inbound DATA payload handed to the application layer.
pub type DataCallback = Arc<dyn Fn(Vec<u8>, Arc<Session>, Option<ConnectionId>) + Send + Sync>;

/// Invoked when a session is bound to a new connection.
pub type SessionRegisterCallback = Arc<dyn Fn(&str, Arc<Session>) + Send + Sync>;

/// Invoked after a connection closes.
pub type DisconnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;

/// Failures starting or driving a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("transport is already running")]
    AlreadyRunning,
}

/// Server-side message transport.
///
/// Send methods are non-blocking: they hand frames to the owning
/// connection's writer and return immediately.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind and start serving. Returns once the listener is accepting.
    async fn start(&self, port: u16) -> Result<(), TransportError>;

    /// Stop accepting, close connections, and halt background tasks.
    async fn stop(&self);

    /// Send to every live connection.
    fn broadcast(&self, data: &[u8]);

    /// Send to one connection.
    fn send_to_client(&self, conn: ConnectionId, data: &[u8]);

    /// Send to a session, queueing offline when no connection is live.
    fn send_to_session(&self, session: &Arc<Session>, data: &[u8]);

    /// Close a connection.
    fn disconnect_client(&self, conn: ConnectionId);

    fn set_data_callback(&self, cb: DataCallback);
    fn set_session_register_callback(&self, cb: SessionRegisterCallback);
    fn set_disconnect_callback(&self, cb: DisconnectCallback);
}
