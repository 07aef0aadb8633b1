//! Ordered middleware execution.
//!
//! Middleware runs before the RPC handler and may mutate the payload,
//! observe the session, or stop the request. Each link receives a
//! [`Next`] continuation; calling it hands control to the rest of the
//! chain, dropping it without calling short-circuits. `Next::call`
//! consumes the continuation, so a link cannot advance the chain twice.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::Session;

/// A middleware link.
///
/// Receives the session, the method name, the mutable payload, and the
/// continuation for the remainder of the chain.
pub type MiddlewareFn = dyn Fn(&Session, &str, &mut Vec<u8>, Next<'_>) + Send + Sync;

/// Shared handle to a registered middleware.
pub type Middleware = Arc<MiddlewareFn>;

/// Continuation invoking the rest of a middleware chain.
///
/// Consumed by [`Next::call`]; dropping it unconsumed short-circuits.
pub struct Next<'a> {
    rest: &'a [Middleware],
    session: &'a Session,
    method: &'a str,
    advanced: &'a Cell<usize>,
}

impl Next<'_> {
    /// Pass control to the next link (or complete the chain when this was
    /// the last one).
    pub fn call(self, payload: &mut Vec<u8>) {
        self.advanced.set(self.advanced.get() + 1);
        if let Some((head, rest)) = self.rest.split_first() {
            head(
                self.session,
                self.method,
                payload,
                Next {
                    rest,
                    session: self.session,
                    method: self.method,
                    advanced: self.advanced,
                },
            );
        }
    }
}

/// Global and per-method middleware, executed globals-first in
/// registration order.
#[derive(Default)]
pub struct MiddlewareChain {
    global: RwLock<Vec<Middleware>>,
    scoped: RwLock<HashMap<String, Vec<Middleware>>>,
}

impl MiddlewareChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a middleware applying to every method.
    pub fn add(&self, mw: Middleware) {
        self.global.write().push(mw);
    }

    /// Append a middleware applying only to `method`.
    pub fn add_for(&self, method: &str, mw: Middleware) {
        self.scoped
            .write()
            .entry(method.to_string())
            .or_default()
            .push(mw);
    }

    /// Append a middleware applying to each listed method.
    pub fn add_for_multi(&self, methods: &[&str], mw: Middleware) {
        let mut scoped = self.scoped.write();
        for method in methods {
            scoped
                .entry((*method).to_string())
                .or_default()
                .push(Arc::clone(&mw));
        }
    }

    /// Run the chain for `method`.
    ///
    /// Returns `true` only when every link called its continuation and
    /// none panicked; the handler must not run otherwise. The payload is
    /// in/out: links may rewrite it before passing it on.
    pub fn execute(&self, session: &Session, method: &str, payload: &mut Vec<u8>) -> bool {
        let chain: Vec<Middleware> = {
            let global = self.global.read();
            let scoped = self.scoped.read();
            global
                .iter()
                .chain(scoped.get(method).into_iter().flatten())
                .cloned()
                .collect()
        };
        let Some((first, rest)) = chain.split_first() else {
            return true;
        };

        let advanced = Cell::new(0usize);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            first(
                session,
                method,
                payload,
                Next {
                    rest,
                    session,
                    method,
                    advanced: &advanced,
                },
            );
        }));
        if outcome.is_err() {
            tracing::warn!(method, "middleware panicked; chain aborted");
            return false;
        }
        if advanced.get() != chain.len() {
            tracing::debug!(method, "middleware short-circuited the chain");
            return false;
        }
        true
    }
}
