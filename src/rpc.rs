//! Method registry and handler context.
//!
//! Handlers come in two shapes: a context handler receiving an
//! [`RpcContext`] with reply/broadcast/disconnect capabilities, and a
//! low-level handler writing its response into an out-buffer. Both are
//! looked up by method name under a mutex; handler failures are caught
//! and logged rather than unwinding into the worker.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;

use crate::session::{ConnectionId, Session};
use crate::transport::Transport;

/// Boxed future returned by context handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handler receiving the request payload and an [`RpcContext`].
pub type ContextHandler = Arc<dyn Fn(Vec<u8>, RpcContext) -> BoxFuture + Send + Sync>;

/// Low-level handler writing its reply into the out-buffer.
pub type RawHandler = Arc<dyn Fn(&[u8], &mut Vec<u8>, &Session) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Context(ContextHandler),
    Raw(RawHandler),
}

/// Result of dispatching a method call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// No handler registered under the method name.
    NotFound,
    /// The handler ran to completion.
    Completed,
    /// The handler panicked; the panic was contained.
    Failed,
}

/// Capabilities exposed to a context handler.
#[derive(Clone)]
pub struct RpcContext {
    session: Arc<Session>,
    conn: Option<ConnectionId>,
    transport: Arc<dyn Transport>,
}

impl RpcContext {
    /// Build a context for one dispatch.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        conn: Option<ConnectionId>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            session,
            conn,
            transport,
        }
    }

    /// The calling session.
    #[must_use]
    pub fn session(&self) -> &Session { &self.session }

    /// Shared handle to the calling session.
    #[must_use]
    pub fn session_arc(&self) -> Arc<Session> { Arc::clone(&self.session) }

    /// Connection the request arrived on, when still known.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> { self.conn }

    /// Send bytes back to the calling connection.
    pub fn reply(&self, data: &[u8]) {
        if let Some(conn) = self.conn {
            self.transport.send_to_client(conn, data);
        }
    }

    /// Send bytes to every live connection.
    pub fn broadcast(&self, data: &[u8]) {
        self.transport.broadcast(data);
    }

    /// Close the calling connection.
    pub fn disconnect(&self) {
        if let Some(conn) = self.conn {
            self.transport.disconnect_client(conn);
        }
    }

    /// Whether the session's `"role"` field equals `expected`.
    #[must_use]
    pub fn has_role(&self, expected: &str) -> bool {
        self.session
            .get::<String>("role")
            .is_some_and(|role| role == expected)
    }
}

/// Thread-safe method-name → handler table.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl RpcRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a context handler for `method`, replacing any previous
    /// registration.
    pub fn register(&self, method: &str, handler: ContextHandler) {
        self.handlers
            .lock()
            .insert(method.to_string(), Handler::Context(handler));
    }

    /// Register a low-level handler for `method`.
    pub fn register_raw(&self, method: &str, handler: RawHandler) {
        self.handlers
            .lock()
            .insert(method.to_string(), Handler::Raw(handler));
    }

    /// Whether a handler exists for `method`.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.lock().contains_key(method)
    }

    /// Invoke the handler for `method`.
    ///
    /// The handler table lock is released before the handler runs. Panics
    /// inside the handler are caught and reported as
    /// [`CallOutcome::Failed`].
    pub async fn call(
        &self,
        method: &str,
        payload: Vec<u8>,
        out: &mut Vec<u8>,
        ctx: RpcContext,
    ) -> CallOutcome {
        let handler = {
            let handlers = self.handlers.lock();
            match handlers.get(method) {
                Some(handler) => handler.clone(),
                None => {
                    tracing::warn!(method, "method not found");
                    return CallOutcome::NotFound;
                }
            }
        };

        match handler {
            Handler::Raw(f) => {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    f(&payload, out, ctx.session());
                }));
                if result.is_err() {
                    tracing::error!(method, "handler panicked");
                    return CallOutcome::Failed;
                }
            }
            Handler::Context(f) => {
                let result = AssertUnwindSafe(f(payload, ctx)).catch_unwind().await;
                if result.is_err() {
                    tracing::error!(method, "handler panicked");
                    return CallOutcome::Failed;
                }
            }
        }
        CallOutcome::Completed
    }
}
