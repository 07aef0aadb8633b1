//! Application wiring and the request dispatch pipeline.
//!
//! [`App`] owns one of everything: transport, protocol, session manager,
//! middleware chain, RPC registry, worker pool, and registered plugins.
//! It is cheap to clone; clones share the same underlying state, so a
//! handle can be passed into handlers and background tasks freely.
//!
//! Inbound DATA payloads run through `parse → middleware → dispatch` on
//! the worker pool; every failure along the way is sent back to the
//! caller as a serialized [`ErrorObj`].

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::error::{ErrorObj, RpcErrorCode};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::plugin::Plugin;
use crate::protocol::{Protocol, SimpleTextProtocol};
use crate::rpc::{CallOutcome, ContextHandler, RawHandler, RpcContext, RpcRegistry};
use crate::session::{ConnectionId, Session, SessionManager};
use crate::transport::{Transport, TransportError};
use crate::worker::WorkerPool;

/// Depth of the worker-pool ingress queue.
const DISPATCH_QUEUE_DEPTH: usize = 1_024;

/// Failures configuring or starting an [`App`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("no transport configured")]
    TransportMissing,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct AppInner {
    chain: MiddlewareChain,
    registry: RpcRegistry,
    manager: Arc<SessionManager>,
    protocol: RwLock<Arc<dyn Protocol>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pool: WorkerPool,
    plugins: Mutex<Vec<Box<dyn Plugin>>>,
}

/// The server application: registration surface plus dispatch pipeline.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// Create an application with the given session TTL and a worker per
    /// available core.
    #[must_use]
    pub fn new(session_ttl_ms: u64) -> Self {
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        Self {
            inner: Arc::new(AppInner {
                chain: MiddlewareChain::new(),
                registry: RpcRegistry::new(),
                manager: Arc::new(SessionManager::new(session_ttl_ms)),
                protocol: RwLock::new(Arc::new(SimpleTextProtocol)),
                transport: RwLock::new(None),
                pool: WorkerPool::new(workers, DISPATCH_QUEUE_DEPTH),
                plugins: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The session manager owned by this application.
    #[must_use]
    pub fn session_manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.inner.manager)
    }

    /// The configured transport, once set.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().clone()
    }

    /// The active protocol.
    #[must_use]
    pub fn protocol(&self) -> Arc<dyn Protocol> {
        self.inner.protocol.read().clone()
    }

    /// Replace the message protocol.
    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self.inner.protocol.write() = protocol;
    }

    /// Install the transport and wire its callbacks into the pipeline.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        let manager = Arc::clone(&self.inner.manager);
        transport.set_session_register_callback(Arc::new(move |_sid, session| {
            manager.attach_session(session);
        }));

        let app = self.clone();
        transport.set_data_callback(Arc::new(move |data, session, conn| {
            app.on_data_received(data, session, conn);
        }));

        transport.set_disconnect_callback(Arc::new(|session| {
            tracing::debug!(sid = %session.id(), "session disconnected");
        }));

        *self.inner.transport.write() = Some(transport);
    }

    /// Register a middleware applying to every method.
    pub fn use_middleware(&self, mw: Middleware) {
        self.inner.chain.add(mw);
    }

    /// Register a middleware for one method.
    pub fn use_for(&self, method: &str, mw: Middleware) {
        self.inner.chain.add_for(method, mw);
    }

    /// Register a middleware for several methods at once.
    pub fn use_for_multi(&self, methods: &[&str], mw: Middleware) {
        self.inner.chain.add_for_multi(methods, mw);
    }

    /// Register a context handler for `method`.
    pub fn register_rpc(&self, method: &str, handler: ContextHandler) {
        self.inner.registry.register(method, handler);
    }

    /// Register a low-level out-buffer handler for `method`.
    pub fn register_rpc_raw(&self, method: &str, handler: RawHandler) {
        self.inner.registry.register_raw(method, handler);
    }

    /// Register a plugin; initialization happens in [`run`](Self::run).
    pub fn use_plugin(&self, plugin: Box<dyn Plugin>) {
        tracing::debug!(plugin = plugin.name(), "plugin registered");
        self.inner.plugins.lock().push(plugin);
    }

    /// Initialize plugins in registration order, then start the transport.
    ///
    /// # Errors
    ///
    /// [`AppError::TransportMissing`] when no transport was set, or the
    /// transport's own start failure.
    pub async fn run(&self, port: u16) -> Result<(), AppError> {
        let transport = self
            .inner
            .transport
            .read()
            .clone()
            .ok_or(AppError::TransportMissing)?;
        {
            let plugins = self.inner.plugins.lock();
            for plugin in plugins.iter() {
                tracing::info!(plugin = plugin.name(), "initializing plugin");
                plugin.initialize();
            }
        }
        transport.start(port).await?;
        Ok(())
    }

    /// Stop the transport and drain the worker pool.
    pub async fn stop(&self) {
        let transport = self.inner.transport.read().clone();
        if let Some(transport) = transport {
            transport.stop().await;
        }
        self.inner.pool.shutdown().await;
    }

    fn on_data_received(
        &self,
        data: Vec<u8>,
        session: Arc<Session>,
        conn: Option<ConnectionId>,
    ) {
        let app = self.clone();
        let submitted = self.inner.pool.submit(async move {
            app.dispatch(data, session, conn).await;
        });
        if let Err(error) = submitted {
            tracing::warn!(%error, "request dropped by worker pool");
        }
    }

    async fn dispatch(&self, data: Vec<u8>, session: Arc<Session>, conn: Option<ConnectionId>) {
        let protocol = self.protocol();
        let Some(transport) = self.transport() else {
            tracing::error!("dispatch without a transport");
            return;
        };

        let mut request = protocol.parse(&data);
        if !request.is_valid() {
            self.send_error(
                &*protocol,
                &*transport,
                conn,
                ErrorObj::new(RpcErrorCode::Parse, "failed to parse incoming data"),
            );
            return;
        }

        let method = request.method.clone();
        if !self
            .inner
            .chain
            .execute(&session, &method, &mut request.payload)
        {
            self.send_error(
                &*protocol,
                &*transport,
                conn,
                ErrorObj::new(RpcErrorCode::Middleware, "access denied by middleware"),
            );
            return;
        }

        let ctx = RpcContext::new(Arc::clone(&session), conn, Arc::clone(&transport));
        let mut out = Vec::new();
        match self
            .inner
            .registry
            .call(&method, request.payload, &mut out, ctx)
            .await
        {
            CallOutcome::NotFound => {
                self.send_error(
                    &*protocol,
                    &*transport,
                    conn,
                    ErrorObj::new(
                        RpcErrorCode::NotFound,
                        format!("method not found: {method}"),
                    ),
                );
            }
            CallOutcome::Failed => {
                self.send_error(
                    &*protocol,
                    &*transport,
                    conn,
                    ErrorObj::new(RpcErrorCode::Internal, "handler failed"),
                );
            }
            CallOutcome::Completed => {
                if !out.is_empty() {
                    if let Some(conn) = conn {
                        transport.send_to_client(conn, &out);
                    }
                }
            }
        }
    }

    fn send_error(
        &self,
        protocol: &dyn Protocol,
        transport: &dyn Transport,
        conn: Option<ConnectionId>,
        err: ErrorObj,
    ) {
        tracing::debug!(code = %err.code, msg = %err.msg, "replying with error");
        if let Some(conn) = conn {
            transport.send_to_client(conn, &protocol.serialize_error(&err));
        }
    }
}
