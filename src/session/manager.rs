//! Session ownership, identity resolution and offline queues.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::identity::ClientIdentity;
use crate::index::GenericIndex;
use crate::session::{FieldValue, FromFieldValue, Session};
use crate::time::now_ms;

/// Per-session offline queue cap.
pub const SESSION_QUEUE_CAP: usize = 1_000;
/// Cap on offline messages across all sessions.
pub const GLOBAL_QUEUE_CAP: usize = 100_000;
/// Age after which a queued offline message is dropped.
pub const MESSAGE_TTL_MS: u64 = 24 * 60 * 60 * 1_000;

/// Interval between background reap/cleanup sweeps.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Message accepted for delivery while its session had no live connection.
#[derive(Clone, Debug)]
pub struct OfflineMessage {
    pub data: Vec<u8>,
    pub enqueued_at_ms: u64,
    pub sid: String,
}

#[derive(Default)]
struct SessionMaps {
    by_sid: HashMap<String, Arc<Session>>,
    by_identity: HashMap<ClientIdentity, Arc<Session>>,
}

#[derive(Default)]
struct OfflineQueues {
    queues: HashMap<String, VecDeque<OfflineMessage>>,
    total: usize,
}

impl OfflineQueues {
    fn drop_expired(&mut self, now: u64) {
        let mut dropped = 0usize;
        self.queues.retain(|_, queue| {
            while queue
                .front()
                .is_some_and(|m| now.saturating_sub(m.enqueued_at_ms) > MESSAGE_TTL_MS)
            {
                queue.pop_front();
                dropped += 1;
            }
            !queue.is_empty()
        });
        self.total = self.total.saturating_sub(dropped);
        if dropped > 0 {
            tracing::debug!(dropped, "expired offline messages removed");
        }
    }
}

/// Owner of every [`Session`] in the process.
///
/// Three locks partition the state: a reader-writer lock over the session
/// maps, a second one over the manager-level key/value state, and a mutex
/// over the offline queues. None is held while invoking user callbacks.
pub struct SessionManager {
    ttl_ms: u64,
    next_sid: AtomicU64,
    index: GenericIndex,
    maps: RwLock<SessionMaps>,
    state: RwLock<HashMap<String, HashMap<String, FieldValue>>>,
    offline: Mutex<OfflineQueues>,
}

impl SessionManager {
    /// Create a manager whose sessions live `ttl_ms` after going offline.
    #[must_use]
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            next_sid: AtomicU64::new(1),
            index: GenericIndex::new(),
            maps: RwLock::new(SessionMaps::default()),
            state: RwLock::new(HashMap::new()),
            offline: Mutex::new(OfflineQueues::default()),
        }
    }

    /// Offline-to-destroy TTL configured for this manager.
    #[must_use]
    pub fn ttl_ms(&self) -> u64 { self.ttl_ms }

    fn make_sid(&self) -> String {
        format!("S{}", self.next_sid.fetch_add(1, Ordering::Relaxed))
    }

    /// Create and register a fresh session for `identity`.
    pub fn create_session(&self, identity: ClientIdentity, now: u64) -> Arc<Session> {
        let sid = self.make_sid();
        let session = Arc::new(Session::new(identity.clone(), sid.clone()));
        session.set_expiry_ms(now + self.ttl_ms);

        let mut maps = self.maps.write();
        maps.by_identity.insert(identity, Arc::clone(&session));
        maps.by_sid.insert(sid.clone(), Arc::clone(&session));
        drop(maps);

        tracing::debug!(sid = %sid, "session created");
        session
    }

    /// Resolve a handshake identity to a session.
    ///
    /// A blank token always creates a fresh session with a newly generated
    /// token. A presented token returns the existing session only when the
    /// session is unexpired and the token matches byte-for-byte; any
    /// mismatch creates a new session and leaves the old one to the
    /// reaper.
    pub fn get_or_create(&self, identity: &ClientIdentity, now: u64) -> Arc<Session> {
        if !identity.has_token() {
            let mut fresh = identity.clone();
            fresh.refresh_token();
            return self.create_session(fresh, now);
        }

        {
            let maps = self.maps.read();
            if let Some(existing) = maps.by_identity.get(identity) {
                if now <= existing.expiry_ms()
                    && existing.identity().session_token == identity.session_token
                {
                    existing.set_expiry_ms(now + self.ttl_ms);
                    tracing::debug!(sid = %existing.id(), "session resumed");
                    return Arc::clone(existing);
                }
                tracing::debug!(
                    sid = %existing.id(),
                    expired = now > existing.expiry_ms(),
                    "reconnect did not match stored session"
                );
            }
        }

        self.create_session(identity.clone(), now)
    }

    /// Destroy every offline session whose expiry deadline has passed.
    pub fn reap(&self, now: u64) {
        if self.ttl_ms == 0 {
            return;
        }
        let mut reaped = Vec::new();
        {
            let mut maps = self.maps.write();
            let expired: Vec<Arc<Session>> = maps
                .by_sid
                .values()
                .filter(|s| s.live_conn().is_none() && s.expiry_ms() < now)
                .cloned()
                .collect();
            for session in expired {
                session.mark_destroying();
                maps.by_sid.remove(session.id());
                if let Some(current) = maps.by_identity.get(session.identity()) {
                    if Arc::ptr_eq(current, &session) {
                        maps.by_identity.remove(session.identity());
                    }
                }
                reaped.push(session);
            }
        }
        if reaped.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for session in &reaped {
            state.remove(session.id());
        }
        drop(state);
        for session in &reaped {
            self.index.remove(session.id());
            tracing::debug!(sid = %session.id(), "session reaped");
        }
    }

    /// Register an externally constructed session.
    pub fn attach_session(&self, session: Arc<Session>) {
        let mut maps = self.maps.write();
        maps.by_identity
            .insert(session.identity().clone(), Arc::clone(&session));
        maps.by_sid.insert(session.id().to_string(), session);
    }

    /// Remove a session and all of its indexed attributes.
    pub fn remove_session(&self, sid: &str) {
        let removed = {
            let mut maps = self.maps.write();
            let removed = maps.by_sid.remove(sid);
            if let Some(session) = &removed {
                session.mark_destroying();
                if let Some(current) = maps.by_identity.get(session.identity()) {
                    if Arc::ptr_eq(current, session) {
                        maps.by_identity.remove(session.identity());
                    }
                }
            }
            removed
        };
        if removed.is_some() {
            self.state.write().remove(sid);
        }
        self.index.remove(sid);
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get_session(&self, sid: &str) -> Option<Arc<Session>> {
        self.maps.read().by_sid.get(sid).cloned()
    }

    /// Snapshot of all live session ids.
    #[must_use]
    pub fn list_session_ids(&self) -> Vec<String> {
        self.maps.read().by_sid.keys().cloned().collect()
    }

    /// Store a value in the manager-level state for `sid`, optionally
    /// registering its canonical string form in the attribute index.
    ///
    /// Returns `false` when `sid` is unknown.
    pub fn set_field(
        &self,
        sid: &str,
        key: &str,
        value: impl Into<FieldValue>,
        indexed: bool,
    ) -> bool {
        if !self.maps.read().by_sid.contains_key(sid) {
            return false;
        }
        let value = value.into();
        let canonical = value.stringify();
        self.state
            .write()
            .entry(sid.to_string())
            .or_default()
            .insert(key.to_string(), value);
        if indexed {
            self.index.add(sid, key, &canonical);
        }
        true
    }

    /// Read a typed value from the manager-level state.
    #[must_use]
    pub fn get_field<T: FromFieldValue>(&self, sid: &str, key: &str) -> Option<T> {
        self.state
            .read()
            .get(sid)
            .and_then(|fields| fields.get(key))
            .and_then(T::from_field_value)
    }

    /// Session ids whose indexed `key` currently equals `value`.
    #[must_use]
    pub fn find_indexed(&self, key: &str, value: &str) -> HashSet<String> {
        self.index
            .find(key, value)
            .map(|set| (*set).clone())
            .unwrap_or_default()
    }

    /// Queue a message for delivery when the session reconnects.
    ///
    /// Expired entries are collected first; the insert is refused when the
    /// global or per-session cap would be exceeded.
    pub fn add_offline_message(&self, sid: &str, data: Vec<u8>) -> bool {
        let now = now_ms();
        let mut offline = self.offline.lock();
        offline.drop_expired(now);

        if offline.total >= GLOBAL_QUEUE_CAP {
            tracing::warn!(sid, "global offline queue cap reached");
            return false;
        }
        let queue = offline.queues.entry(sid.to_string()).or_default();
        if queue.len() >= SESSION_QUEUE_CAP {
            tracing::warn!(sid, "per-session offline queue cap reached");
            return false;
        }
        queue.push_back(OfflineMessage {
            data,
            enqueued_at_ms: now,
            sid: sid.to_string(),
        });
        offline.total += 1;
        true
    }

    /// Flush the offline queue for `sid` through `send` in enqueue order,
    /// then delete the queue.
    ///
    /// The queue lock is released before `send` runs.
    pub fn process_offline_messages(&self, sid: &str, mut send: impl FnMut(&[u8])) {
        let drained = {
            let mut offline = self.offline.lock();
            match offline.queues.remove(sid) {
                Some(queue) => {
                    offline.total = offline.total.saturating_sub(queue.len());
                    queue
                }
                None => return,
            }
        };
        tracing::debug!(sid, count = drained.len(), "flushing offline queue");
        for message in &drained {
            send(&message.data);
        }
    }

    /// Drop queued messages older than [`MESSAGE_TTL_MS`] and delete
    /// queues left empty.
    pub fn cleanup_old_messages(&self) {
        self.offline.lock().drop_expired(now_ms());
    }

    /// Number of offline messages currently queued across all sessions.
    #[must_use]
    pub fn offline_backlog(&self) -> usize {
        self.offline.lock().total
    }

    /// Start the background sweep that reaps expired sessions and ages out
    /// offline messages once per minute until `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                        manager.reap(now_ms());
                        manager.cleanup_old_messages();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionId;

    fn identity(client: &str, device: u64) -> ClientIdentity {
        ClientIdentity::new(client, device)
    }

    #[test]
    fn blank_token_always_creates_with_fresh_token() {
        let mgr = SessionManager::new(60_000);
        let a = mgr.get_or_create(&identity("alice", 1), 0);
        let b = mgr.get_or_create(&identity("alice", 1), 0);
        assert_ne!(a.id(), b.id());
        assert!(a.identity().has_token());
        assert!(b.identity().has_token());
    }

    #[test]
    fn matching_token_resumes_and_refreshes_expiry() {
        let mgr = SessionManager::new(60_000);
        let first = mgr.get_or_create(&identity("alice", 1), 0);
        let mut presented = identity("alice", 1);
        presented.session_token = first.identity().session_token;

        let resumed = mgr.get_or_create(&presented, 10_000);
        assert_eq!(resumed.id(), first.id());
        assert_eq!(resumed.expiry_ms(), 70_000);
    }

    #[test]
    fn wrong_token_creates_new_session_and_keeps_old() {
        let mgr = SessionManager::new(60_000);
        let first = mgr.get_or_create(&identity("alice", 1), 0);
        let mut presented = identity("alice", 1);
        presented.session_token = [0xAB; 16];

        let second = mgr.get_or_create(&presented, 1_000);
        assert_ne!(second.id(), first.id());
        assert!(mgr.get_session(first.id()).is_some());
        assert!(mgr.get_session(second.id()).is_some());
    }

    #[test]
    fn expired_session_is_not_resumed() {
        let mgr = SessionManager::new(1_000);
        let first = mgr.get_or_create(&identity("alice", 1), 0);
        let mut presented = identity("alice", 1);
        presented.session_token = first.identity().session_token;

        let second = mgr.get_or_create(&presented, 5_000);
        assert_ne!(second.id(), first.id());
    }

    #[test]
    fn reap_removes_expired_offline_sessions_only() {
        let mgr = SessionManager::new(1_000);
        let gone = mgr.create_session(identity("expired", 1), 0);
        let online = mgr.create_session(identity("online", 2), 0);
        online.rebind(Some(ConnectionId::from(1)));
        let fresh = mgr.create_session(identity("fresh", 3), 10_000);

        mgr.set_field(gone.id(), "room", "lobby", true);
        mgr.reap(5_000);

        assert!(mgr.get_session(gone.id()).is_none());
        assert!(mgr.get_session(online.id()).is_some());
        assert!(mgr.get_session(fresh.id()).is_some());
        assert!(mgr.find_indexed("room", "lobby").is_empty());
    }

    #[test]
    fn remove_session_clears_index_entries() {
        let mgr = SessionManager::new(60_000);
        let s = mgr.create_session(identity("alice", 1), 0);
        mgr.set_field(s.id(), "room", "lobby", true);
        mgr.remove_session(s.id());
        assert!(mgr.get_session(s.id()).is_none());
        assert!(mgr.find_indexed("room", "lobby").is_empty());
        assert!(!mgr.set_field(s.id(), "room", "garden", true));
    }

    #[test]
    fn set_field_reindexes_on_value_change() {
        let mgr = SessionManager::new(60_000);
        let s = mgr.create_session(identity("alice", 1), 0);
        assert!(mgr.set_field(s.id(), "room", "lobby", true));
        assert!(mgr.set_field(s.id(), "room", "garden", true));
        assert!(mgr.find_indexed("room", "lobby").is_empty());
        assert!(mgr.find_indexed("room", "garden").contains(s.id()));
        assert_eq!(mgr.get_field::<String>(s.id(), "room").as_deref(), Some("garden"));
    }

    #[test]
    fn get_field_is_type_checked() {
        let mgr = SessionManager::new(60_000);
        let s = mgr.create_session(identity("alice", 1), 0);
        mgr.set_field(s.id(), "admin", true, false);
        assert_eq!(mgr.get_field::<bool>(s.id(), "admin"), Some(true));
        assert_eq!(mgr.get_field::<String>(s.id(), "admin"), None);
    }

    #[test]
    fn offline_queue_respects_per_session_cap() {
        let mgr = SessionManager::new(60_000);
        let s = mgr.create_session(identity("alice", 1), 0);
        for i in 0..SESSION_QUEUE_CAP {
            assert!(mgr.add_offline_message(s.id(), vec![i as u8]));
        }
        assert!(!mgr.add_offline_message(s.id(), vec![0xFF]));
        assert_eq!(mgr.offline_backlog(), SESSION_QUEUE_CAP);
    }

    #[test]
    fn offline_queue_flushes_in_enqueue_order_then_deletes() {
        let mgr = SessionManager::new(60_000);
        let s = mgr.create_session(identity("alice", 1), 0);
        mgr.add_offline_message(s.id(), b"first".to_vec());
        mgr.add_offline_message(s.id(), b"second".to_vec());

        let mut seen = Vec::new();
        mgr.process_offline_messages(s.id(), |data| seen.push(data.to_vec()));
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(mgr.offline_backlog(), 0);

        seen.clear();
        mgr.process_offline_messages(s.id(), |data| seen.push(data.to_vec()));
        assert!(seen.is_empty());
    }
}
