//! Network parameters and their protocol floors.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    ACK_TIMER_BASE, DEFAULT_BLOCK_ACK_DELAY, DEFAULT_BLOCK_ACK_JITTER,
    DEFAULT_MAX_REASSEMBLY_SESSIONS, DEFAULT_REPLAY_CACHE_CAPACITY, DEFAULT_RETRANSMISSION_LIMIT,
    DEFAULT_TTL, MAX_BLOCK_ACK_JITTER, MAX_RETRANSMISSION_LIMIT, MAX_SEGMENTS,
    MIN_ACK_MESSAGE_TIMEOUT, MIN_INCOMPLETE_TIMEOUT, TIMER_PER_HOP, TRANSMISSION_TIMER_BASE,
    TTL_MAX, TTL_MIN_OUTBOUND,
};

/// Smallest replay cache the manager accepts.
const MIN_REPLAY_CACHE_CAPACITY: usize = 16;

/// Largest number of concurrent reassembly sessions.
const MAX_REASSEMBLY_SESSIONS: usize = 256;

/// Tunable timing and cache parameters of a network manager.
///
/// Values are forced into protocol floors and ceilings by
/// [`clamped`](Self::clamped); the manager only ever uses clamped values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParameters {
    /// TTL for outbound messages when the caller gives none.
    pub default_ttl: u8,

    /// Lifetime of an incomplete reassembly session.
    pub incomplete_message_timeout: Duration,

    /// Floor of the sender acknowledgment timer.
    pub acknowledgment_timer_interval: Duration,

    /// Floor of the sender transmission timer.
    pub transmission_timer_interval: Duration,

    /// Segment retransmission rounds after the first transmission.
    pub retransmission_limit: u8,

    /// Time to wait for the response to an acknowledged message.
    pub acknowledgment_message_timeout: Duration,

    /// Delay before a receiver returns a Block Acknowledgment.
    pub block_ack_delay: Duration,

    /// Upper bound of the random jitter added to the Block Ack delay.
    pub block_ack_jitter: Duration,

    /// Concurrent reassembly sessions.
    pub max_reassembly_sessions: usize,

    /// Largest accepted segment count of an inbound message.
    pub max_segments: usize,

    /// Sources tracked by the replay cache.
    pub replay_cache_capacity: usize,
}

impl Default for NetworkParameters {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            incomplete_message_timeout: MIN_INCOMPLETE_TIMEOUT,
            acknowledgment_timer_interval: ACK_TIMER_BASE,
            transmission_timer_interval: TRANSMISSION_TIMER_BASE,
            retransmission_limit: DEFAULT_RETRANSMISSION_LIMIT,
            acknowledgment_message_timeout: MIN_ACK_MESSAGE_TIMEOUT,
            block_ack_delay: DEFAULT_BLOCK_ACK_DELAY,
            block_ack_jitter: DEFAULT_BLOCK_ACK_JITTER,
            max_reassembly_sessions: DEFAULT_MAX_REASSEMBLY_SESSIONS,
            max_segments: MAX_SEGMENTS,
            replay_cache_capacity: DEFAULT_REPLAY_CACHE_CAPACITY,
        }
    }
}

impl NetworkParameters {
    /// Start from the defaults.
    pub fn builder() -> NetworkParametersBuilder {
        NetworkParametersBuilder::new()
    }

    /// Force every value into its valid range.
    pub fn clamped(mut self) -> Self {
        self.default_ttl = self.default_ttl.clamp(TTL_MIN_OUTBOUND, TTL_MAX);
        self.incomplete_message_timeout = self.incomplete_message_timeout.max(MIN_INCOMPLETE_TIMEOUT);
        self.acknowledgment_timer_interval = self.acknowledgment_timer_interval.max(ACK_TIMER_BASE);
        self.transmission_timer_interval = self
            .transmission_timer_interval
            .max(TRANSMISSION_TIMER_BASE);
        self.retransmission_limit = self.retransmission_limit.min(MAX_RETRANSMISSION_LIMIT);
        self.acknowledgment_message_timeout = self
            .acknowledgment_message_timeout
            .max(MIN_ACK_MESSAGE_TIMEOUT);
        self.block_ack_jitter = self.block_ack_jitter.min(MAX_BLOCK_ACK_JITTER);
        self.max_reassembly_sessions = self.max_reassembly_sessions.clamp(1, MAX_REASSEMBLY_SESSIONS);
        self.max_segments = self.max_segments.clamp(1, MAX_SEGMENTS);
        self.replay_cache_capacity = self.replay_cache_capacity.max(MIN_REPLAY_CACHE_CAPACITY);
        self
    }

    /// Interval between segment retransmission rounds for `ttl`.
    pub fn acknowledgment_timer(&self, ttl: u8) -> Duration {
        self.acknowledgment_timer_interval.max(ACK_TIMER_BASE) + TIMER_PER_HOP * u32::from(ttl)
    }

    /// Final wait after the last retransmission round for `ttl`.
    pub fn transmission_timer(&self, ttl: u8) -> Duration {
        self.transmission_timer_interval.max(TRANSMISSION_TIMER_BASE) + TIMER_PER_HOP * u32::from(ttl)
    }

    /// Block Ack delay with fresh random jitter.
    pub fn block_ack_delay(&self) -> Duration {
        let jitter = self.block_ack_jitter.min(MAX_BLOCK_ACK_JITTER).as_millis() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        self.block_ack_delay + Duration::from_millis(extra)
    }
}

/// Builder for [`NetworkParameters`].
#[derive(Debug, Default)]
pub struct NetworkParametersBuilder {
    params: NetworkParameters,
}

impl NetworkParametersBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn default_ttl(mut self, ttl: u8) -> Self {
        self.params.default_ttl = ttl;
        self
    }

    /// Set the incomplete message timeout.
    pub fn incomplete_message_timeout(mut self, timeout: Duration) -> Self {
        self.params.incomplete_message_timeout = timeout;
        self
    }

    /// Set the acknowledgment timer floor.
    pub fn acknowledgment_timer_interval(mut self, interval: Duration) -> Self {
        self.params.acknowledgment_timer_interval = interval;
        self
    }

    /// Set the transmission timer floor.
    pub fn transmission_timer_interval(mut self, interval: Duration) -> Self {
        self.params.transmission_timer_interval = interval;
        self
    }

    /// Set the segment retransmission limit.
    pub fn retransmission_limit(mut self, limit: u8) -> Self {
        self.params.retransmission_limit = limit;
        self
    }

    /// Set the acknowledged message timeout.
    pub fn acknowledgment_message_timeout(mut self, timeout: Duration) -> Self {
        self.params.acknowledgment_message_timeout = timeout;
        self
    }

    /// Set the Block Ack delay and jitter bound.
    pub fn block_ack_delay(mut self, delay: Duration, jitter: Duration) -> Self {
        self.params.block_ack_delay = delay;
        self.params.block_ack_jitter = jitter;
        self
    }

    /// Set the reassembly session cap.
    pub fn max_reassembly_sessions(mut self, sessions: usize) -> Self {
        self.params.max_reassembly_sessions = sessions;
        self
    }

    /// Set the largest accepted segment count.
    pub fn max_segments(mut self, segments: usize) -> Self {
        self.params.max_segments = segments;
        self
    }

    /// Set the replay cache capacity.
    pub fn replay_cache_capacity(mut self, capacity: usize) -> Self {
        self.params.replay_cache_capacity = capacity;
        self
    }

    /// Build the clamped parameters.
    pub fn build(self) -> NetworkParameters {
        self.params.clamped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps() {
        let params = NetworkParameters {
            default_ttl: 0,
            incomplete_message_timeout: Duration::from_secs(1),
            acknowledgment_timer_interval: Duration::from_millis(10),
            transmission_timer_interval: Duration::from_millis(10),
            retransmission_limit: 50,
            acknowledgment_message_timeout: Duration::from_secs(2),
            block_ack_delay: Duration::ZERO,
            block_ack_jitter: Duration::from_secs(5),
            max_reassembly_sessions: 0,
            max_segments: 100,
            replay_cache_capacity: 1,
        }
        .clamped();

        assert_eq!(params.default_ttl, 2);
        assert_eq!(params.incomplete_message_timeout, Duration::from_secs(10));
        assert_eq!(params.acknowledgment_timer_interval, Duration::from_millis(150));
        assert_eq!(params.transmission_timer_interval, Duration::from_millis(200));
        assert_eq!(params.retransmission_limit, 8);
        assert_eq!(params.acknowledgment_message_timeout, Duration::from_secs(30));
        assert_eq!(params.block_ack_jitter, Duration::from_millis(100));
        assert_eq!(params.max_reassembly_sessions, 1);
        assert_eq!(params.max_segments, 32);
        assert_eq!(params.replay_cache_capacity, 16);

        let high = NetworkParameters::builder().default_ttl(200).build();
        assert_eq!(high.default_ttl, 127);
    }

    #[test]
    fn test_defaults_are_already_clamped() {
        assert_eq!(NetworkParameters::default().clamped(), NetworkParameters::default());
    }

    #[test]
    fn test_timer_formulas() {
        let params = NetworkParameters::default();
        assert_eq!(params.acknowledgment_timer(5), Duration::from_millis(400));
        assert_eq!(params.transmission_timer(5), Duration::from_millis(450));

        let slow = NetworkParameters::builder()
            .acknowledgment_timer_interval(Duration::from_millis(300))
            .build();
        assert_eq!(slow.acknowledgment_timer(0), Duration::from_millis(300));
    }

    #[test]
    fn test_block_ack_delay_bounds() {
        let params = NetworkParameters::default();
        for _ in 0..50 {
            let delay = params.block_ack_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(70));
        }

        let fixed = NetworkParameters::builder()
            .block_ack_delay(Duration::from_millis(10), Duration::ZERO)
            .build();
        assert_eq!(fixed.block_ack_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_serde_roundtrip_with_defaults() {
        let json = r#"{"default_ttl": 9, "retransmission_limit": 4}"#;
        let params: NetworkParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.default_ttl, 9);
        assert_eq!(params.retransmission_limit, 4);
        assert_eq!(params.max_segments, MAX_SEGMENTS);
    }
}
