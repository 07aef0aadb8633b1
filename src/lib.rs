//! Session-aware binary RPC over WebSocket.
//!
//! `wsrpc` is a server framework with three load-bearing pieces: a
//! reliability-tiered delivery state machine (fire-and-forget,
//! at-least-once with ACK and retry, exactly-once via a four-way
//! handshake), a session layer that rebinds a stable logical session to
//! new transport connections across reconnects, and a dispatch pipeline
//! running parsed requests through ordered middleware into registered
//! handlers on a worker pool.

pub mod api;
pub mod app;
pub mod backoff;
pub mod conn_state;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod identity;
pub mod index;
pub mod middleware;
pub mod plugin;
pub mod protocol;
pub mod qos;
pub mod rpc;
pub mod session;
pub mod time;
pub mod transport;
pub mod worker;

pub use api::FrameworkApi;
pub use app::{App, AppError};
pub use backoff::{BackoffStrategy, ExponentialBackoff, LinearBackoff};
pub use error::{ErrorObj, RpcErrorCode};
pub use frame::{FrameType, HEADER_LEN};
pub use identity::ClientIdentity;
pub use middleware::{Middleware, MiddlewareChain, Next};
pub use plugin::Plugin;
pub use protocol::{MsgPackProtocol, ParsedRequest, Protocol, SimpleTextProtocol};
pub use qos::{QosLevel, ReliableOptions};
pub use rpc::{RpcContext, RpcRegistry};
pub use session::{
    ConnectionId, FieldValue, FromFieldValue, Session, SessionManager, SessionStatus,
};
pub use transport::{
    HandshakeInspector, HeaderInspector, Transport, TransportError, WebSocketTransport,
};
pub use worker::{ShutdownPolicy, WorkerPool};
