//! Delivery guarantees and reliability configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffStrategy, ExponentialBackoff};

/// Delivery guarantee applied to outbound messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QosLevel {
    /// Fire-and-forget; nothing is tracked.
    #[default]
    None,
    /// At-least-once: track, retry until acknowledged.
    AtLeastOnce,
    /// Exactly-once: four-way handshake per message.
    ExactlyOnce,
}

/// Reliability tuning for the transport.
///
/// `max_retry == 0` means retry forever. When no custom
/// [`BackoffStrategy`] is installed, an exponential strategy built from
/// `base_retry_ms`/`max_backoff_ms` is used.
#[derive(Clone)]
pub struct ReliableOptions {
    pub level: QosLevel,
    pub base_retry_ms: u64,
    pub max_retry: u32,
    pub max_backoff_ms: u64,
    pub session_ttl_ms: u64,
    pub duplicate_ttl_ms: u64,
    pub backoff: Option<Arc<dyn BackoffStrategy>>,
    /// Advisory to the transport; applied when the socket supports it.
    pub enable_compression: bool,
    pub compression_threshold_bytes: usize,
    /// Per-connection cap on queued outbound frames before the connection
    /// is closed for backpressure overflow.
    pub max_send_queue_size: usize,
}

impl Default for ReliableOptions {
    fn default() -> Self {
        Self {
            level: QosLevel::None,
            base_retry_ms: 100,
            max_retry: 3,
            max_backoff_ms: 1_000,
            session_ttl_ms: 15 * 60 * 1_000,
            duplicate_ttl_ms: 5_000,
            backoff: None,
            enable_compression: false,
            compression_threshold_bytes: 1_024,
            max_send_queue_size: 1_000,
        }
    }
}

impl ReliableOptions {
    /// Convenience constructor for a given level with default tuning.
    #[must_use]
    pub fn with_level(level: QosLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// The installed back-off strategy, or the default exponential one.
    #[must_use]
    pub fn backoff_strategy(&self) -> Arc<dyn BackoffStrategy> {
        self.backoff.clone().unwrap_or_else(|| {
            Arc::new(ExponentialBackoff::new(
                Duration::from_millis(self.base_retry_ms),
                Duration::from_millis(self.max_backoff_ms),
            ))
        })
    }

    /// Window for inbound duplicate suppression.
    #[must_use]
    pub fn duplicate_ttl(&self) -> Duration {
        Duration::from_millis(self.duplicate_ttl_ms)
    }
}

impl std::fmt::Debug for ReliableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableOptions")
            .field("level", &self.level)
            .field("base_retry_ms", &self.base_retry_ms)
            .field("max_retry", &self.max_retry)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("session_ttl_ms", &self.session_ttl_ms)
            .field("duplicate_ttl_ms", &self.duplicate_ttl_ms)
            .field("custom_backoff", &self.backoff.is_some())
            .field("enable_compression", &self.enable_compression)
            .field("compression_threshold_bytes", &self.compression_threshold_bytes)
            .field("max_send_queue_size", &self.max_send_queue_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_is_exponential_from_fields() {
        let opts = ReliableOptions {
            base_retry_ms: 50,
            max_backoff_ms: 150,
            ..ReliableOptions::default()
        };
        let strategy = opts.backoff_strategy();
        assert_eq!(strategy.next_delay(1), Duration::from_millis(50));
        assert_eq!(strategy.next_delay(2), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(3), Duration::from_millis(150));
    }

    #[test]
    fn custom_strategy_wins_over_fields() {
        use crate::backoff::LinearBackoff;

        let opts = ReliableOptions {
            base_retry_ms: 1,
            backoff: Some(Arc::new(LinearBackoff::new(
                Duration::from_millis(10),
                Duration::from_millis(30),
            ))),
            ..ReliableOptions::default()
        };
        assert_eq!(opts.backoff_strategy().next_delay(2), Duration::from_millis(20));
    }
}
