//! Per-connection reliability state.
//!
//! A [`ConnState`] holds the QoS buffers for one transport connection. It
//! is shared between the owning connection and the session, so a reconnect
//! rebinds the same buffers to the new connection and in-flight messages
//! survive the transport swap.
//!
//! Two locks partition the state: `pend` guards the at-least-once pipeline
//! (pending frames, the seen set, and the exactly-once payload stashes),
//! `q2` guards the exactly-once stage table. They are never held at the
//! same time; every state-machine step acquires them sequentially.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// An unacknowledged at-least-once frame.
#[derive(Clone, Debug)]
pub struct FrameInfo {
    /// Encoded frame bytes, resent verbatim on retry.
    pub frame: Vec<u8>,
    pub retry_count: u32,
    pub next_retry_at: Instant,
}

/// Stage of the exactly-once handshake, from the publisher's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qos2Stage {
    /// PREPARE sent, waiting for PREPARE_ACK.
    Prepare,
    /// COMMIT sent, waiting for COMPLETE.
    Commit,
}

/// In-flight exactly-once delivery.
#[derive(Clone, Debug)]
pub struct Qos2Meta {
    pub stage: Qos2Stage,
    /// Frame appropriate to the current stage, resent on retry.
    pub frame: Vec<u8>,
    pub retry_count: u32,
    pub next_retry_at: Instant,
    pub last_touched_at: Instant,
}

/// State guarded by the `pend` lock.
#[derive(Default)]
pub struct PendState {
    /// Unacknowledged QoS-1 frames by message id.
    pub pending1: HashMap<u64, FrameInfo>,
    /// Inbound ids already acknowledged and dispatched.
    pub seen_set: HashSet<u64>,
    /// FIFO of `(id, first_seen)` backing TTL eviction of `seen_set`.
    pub seen_queue: VecDeque<(u64, Instant)>,
    /// QoS-2 payloads staged while PREPARE is in flight.
    pub pub_prepare: HashMap<u64, Vec<u8>>,
    /// QoS-2 payloads to deliver once COMPLETE arrives.
    pub pending_resp: HashMap<u64, Vec<u8>>,
    /// Bytes held across all buffers, for backpressure accounting.
    pub queued_bytes: usize,
}

/// Reliability state carried across rebinds via the session.
pub struct ConnState {
    next_id: AtomicU64,
    pub pend: RwLock<PendState>,
    pub q2: RwLock<HashMap<u64, Qos2Meta>>,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pend: RwLock::new(PendState::default()),
            q2: RwLock::new(HashMap::new()),
        }
    }
}

impl ConnState {
    /// Create fresh state with the id counter at 1.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Allocate the next outbound message id. Strictly increasing for the
    /// lifetime of this state.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an inbound id, evicting entries older than `ttl` first.
    ///
    /// Returns `true` when the id was not in the window and the message
    /// should be dispatched, `false` for a retransmission of an id
    /// already handled on this connection.
    pub fn register_seen(&self, id: u64, ttl: Duration) -> bool {
        self.register_seen_at(id, ttl, Instant::now())
    }

    pub(crate) fn register_seen_at(&self, id: u64, ttl: Duration, now: Instant) -> bool {
        let mut pend = self.pend.write();
        while let Some(&(front, at)) = pend.seen_queue.front() {
            if now.duration_since(at) > ttl {
                pend.seen_set.remove(&front);
                pend.seen_queue.pop_front();
            } else {
                break;
            }
        }
        if pend.seen_set.insert(id) {
            pend.seen_queue.push_back((id, now));
            true
        } else {
            false
        }
    }

    /// Drop all reliability buffers. Used when the reliability options are
    /// reconfigured in a way that invalidates in-flight state.
    pub fn clear(&self) {
        let mut pend = self.pend.write();
        pend.pending1.clear();
        pend.seen_set.clear();
        pend.seen_queue.clear();
        pend.pub_prepare.clear();
        pend.pending_resp.clear();
        pend.queued_bytes = 0;
        drop(pend);
        self.q2.write().clear();
    }
}
