//! Session-addressed convenience facade.
//!
//! [`FrameworkApi`] bundles the session manager and the transport so
//! application code can reach clients by session id without holding both
//! halves itself.

use std::sync::Arc;

use crate::session::{FieldValue, FromFieldValue, Session, SessionManager};
use crate::transport::Transport;

/// Facade over the session manager and transport.
#[derive(Clone)]
pub struct FrameworkApi {
    manager: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
}

impl FrameworkApi {
    /// Bundle a manager and a transport.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, transport: Arc<dyn Transport>) -> Self {
        Self { manager, transport }
    }

    /// Send to the session's live connection.
    ///
    /// Returns `false` when the session is unknown or has no live
    /// connection; nothing is queued in that case.
    pub fn send_to(&self, sid: &str, data: &[u8]) -> bool {
        let Some(session) = self.manager.get_session(sid) else {
            return false;
        };
        let Some(conn) = session.live_conn() else {
            return false;
        };
        self.transport.send_to_client(conn, data);
        true
    }

    /// Send to a session, queueing offline when it has no live
    /// connection.
    pub fn send_to_session(&self, session: &Arc<Session>, data: &[u8]) {
        self.transport.send_to_session(session, data);
    }

    /// Close the session's live connection.
    ///
    /// Returns `false` when the session is unknown or offline.
    pub fn disconnect(&self, sid: &str) -> bool {
        let Some(session) = self.manager.get_session(sid) else {
            return false;
        };
        let Some(conn) = session.live_conn() else {
            return false;
        };
        self.transport.disconnect_client(conn);
        true
    }

    /// Snapshot of all session ids.
    #[must_use]
    pub fn list_session_ids(&self) -> Vec<String> {
        self.manager.list_session_ids()
    }

    /// Sessions whose indexed `key` equals `value`.
    #[must_use]
    pub fn find_by(&self, key: &str, value: &str) -> Vec<Arc<Session>> {
        self.manager
            .find_indexed(key, value)
            .into_iter()
            .filter_map(|sid| self.manager.get_session(&sid))
            .collect()
    }

    /// Store a field for `sid`, optionally indexed.
    pub fn set_field(
        &self,
        sid: &str,
        key: &str,
        value: impl Into<FieldValue>,
        indexed: bool,
    ) -> bool {
        self.manager.set_field(sid, key, value, indexed)
    }

    /// Read a typed field for `sid`.
    #[must_use]
    pub fn get_field<T: FromFieldValue>(&self, sid: &str, key: &str) -> Option<T> {
        self.manager.get_field(sid, key)
    }
}
