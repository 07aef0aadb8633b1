//! Logical client sessions.
//!
//! A [`Session`] is the stable server-side identity of a client across
//! reconnects. The session manager owns every session; a live transport
//! connection is referenced only by its [`ConnectionId`], never by
//! pointer, and is swapped atomically on rebind.

mod manager;

pub use manager::{OfflineMessage, SessionManager, GLOBAL_QUEUE_CAP, MESSAGE_TTL_MS, SESSION_QUEUE_CAP};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::conn_state::ConnState;
use crate::dedup::DuplicateFilter;
use crate::identity::ClientIdentity;

/// Identifier assigned to a transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Whether a session currently has a bound transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Online,
    Offline,
}

/// Typed value stored in a session's key/value state.
///
/// A closed sum over the value kinds the framework indexes; each kind has
/// a canonical string form used by the attribute index.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
    StrList(Vec<String>),
}

impl FieldValue {
    /// Canonical string form used as the index value.
    #[must_use]
    pub fn stringify(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Self::Int(i) => i.to_string(),
            Self::StrList(items) => items.join(","),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self { Self::Str(value) }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self { Self::Str(value.to_string()) }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self { Self::Bool(value) }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self { Self::Int(value) }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self { Self::StrList(value) }
}

/// Extraction of a concrete type from a stored [`FieldValue`].
///
/// A kind mismatch yields `None`, never a panic.
pub trait FromFieldValue: Sized {
    fn from_field_value(value: &FieldValue) -> Option<Self>;
}

impl FromFieldValue for String {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromFieldValue for bool {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromFieldValue for i64 {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromFieldValue for Vec<String> {
    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::StrList(items) => Some(items.clone()),
            _ => None,
        }
    }
}

/// Per-identity server-side state surviving reconnects.
pub struct Session {
    sid: String,
    identity: ClientIdentity,
    live: RwLock<Option<ConnectionId>>,
    expiry_ms: AtomicU64,
    data: RwLock<HashMap<String, FieldValue>>,
    dup_filter: Mutex<DuplicateFilter>,
    conn_state: Arc<ConnState>,
    destroying: AtomicBool,
}

impl Session {
    /// Construct a session bound to nothing.
    #[must_use]
    pub fn new(identity: ClientIdentity, sid: String) -> Self {
        Self {
            sid,
            identity,
            live: RwLock::new(None),
            expiry_ms: AtomicU64::new(0),
            data: RwLock::new(HashMap::new()),
            dup_filter: Mutex::new(DuplicateFilter::new()),
            conn_state: Arc::new(ConnState::new()),
            destroying: AtomicBool::new(false),
        }
    }

    /// Stable session id.
    #[must_use]
    pub fn id(&self) -> &str { &self.sid }

    /// Identity presented at the handshake that created this session.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity { &self.identity }

    /// Replace the bound connection.
    ///
    /// Resets the inbound duplicate filter, because message ids restart
    /// from the new connection's perspective. Ignored when the session is
    /// being torn down.
    pub fn rebind(&self, conn: Option<ConnectionId>) {
        if self.destroying.load(Ordering::Acquire) {
            return;
        }
        *self.live.write() = conn;
        *self.dup_filter.lock() = DuplicateFilter::new();
    }

    /// Currently bound connection, if any.
    #[must_use]
    pub fn live_conn(&self) -> Option<ConnectionId> { *self.live.read() }

    /// Online when a connection is bound, Offline otherwise.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.live.read().is_some() {
            SessionStatus::Online
        } else {
            SessionStatus::Offline
        }
    }

    /// Store a value in the session-local key/value state.
    pub fn set(&self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Read a typed value from the session-local state.
    ///
    /// Absent keys and kind mismatches both yield `None`.
    #[must_use]
    pub fn get<T: FromFieldValue>(&self, key: &str) -> Option<T> {
        self.data.read().get(key).and_then(T::from_field_value)
    }

    /// Run the payload through the inbound duplicate filter.
    ///
    /// `true` means the call is fresh and should be dispatched.
    pub fn accept_duplicate(&self, payload: &[u8], ttl: Duration) -> bool {
        self.dup_filter.lock().accept(payload, ttl)
    }

    /// Reliability buffers shared with the bound connection.
    #[must_use]
    pub fn conn_state(&self) -> Arc<ConnState> { Arc::clone(&self.conn_state) }

    /// Deadline on the monotonic millisecond timeline after which an
    /// offline session may be reaped.
    #[must_use]
    pub fn expiry_ms(&self) -> u64 { self.expiry_ms.load(Ordering::Acquire) }

    pub fn set_expiry_ms(&self, deadline: u64) {
        self.expiry_ms.store(deadline, Ordering::Release);
    }

    pub(crate) fn mark_destroying(&self) {
        self.destroying.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("client_id", &self.identity.client_id)
            .field("device_id", &self.identity.device_id)
            .field("status", &self.status())
            .finish()
    }
}
