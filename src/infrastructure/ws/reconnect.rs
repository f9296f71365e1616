//! Reconnection Policy
//!
//! Exponential backoff with jitter for WebSocket reconnection, with two
//! behaviors the venues force on us:
//!
//! - the delay resets to its floor only after a *stable* session (the prior
//!   connection stayed in streaming state longer than a minimum uptime), so a
//!   venue that accepts the handshake and immediately drops does not get
//!   hammered in a fast-spin loop;
//! - a rate-limited handshake (HTTP 429-class rejection) seeds the next delay
//!   from a distinct, larger floor than generic transport failures.

use std::time::{Duration, Instant};

use rand::Rng;

/// How the previous connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Socket closed, reset, timed out, or any other transport fault.
    Transport,
    /// The venue rejected the handshake for rate-limiting reasons.
    RateLimited,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Floor delay seeded after a stable session or on first attempt.
    pub floor: Duration,
    /// Ceiling the delay never exceeds.
    pub ceiling: Duration,
    /// Floor used instead of `floor` after a rate-limited handshake.
    pub rate_limit_floor: Duration,
    /// Multiplier applied between consecutive unstable attempts.
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Minimum streaming uptime for a session to count as stable.
    pub stable_uptime: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            rate_limit_floor: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            stable_uptime: Duration::from_secs(30),
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter and a
/// stable-uptime reset rule.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current_delay: Duration,
    attempt_count: u32,
    session_started: Option<Instant>,
}

impl BackoffPolicy {
    /// Create a new policy seeded at the floor.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let floor = config.floor;
        Self {
            config,
            current_delay: floor,
            attempt_count: 0,
            session_started: None,
        }
    }

    /// Record that a connection reached streaming state.
    ///
    /// The delay is *not* reset here; whether the session was stable is only
    /// known at disconnect time.
    pub fn on_streaming(&mut self) {
        self.session_started = Some(Instant::now());
    }

    /// Record a disconnect and compute the delay before the next attempt.
    ///
    /// A session that streamed at least `stable_uptime` resets the delay to
    /// the floor; anything shorter (including handshake failures, where no
    /// streaming ever began) escalates the current delay. Rate-limited
    /// rejections additionally raise the delay to the rate-limit floor.
    pub fn on_disconnect(&mut self, class: DisconnectClass) -> Duration {
        let uptime = self.session_started.take().map(|t| t.elapsed());
        let stable = uptime.is_some_and(|u| u >= self.config.stable_uptime);

        if stable {
            self.current_delay = self.config.floor;
            self.attempt_count = 0;
        }

        self.attempt_count += 1;

        if class == DisconnectClass::RateLimited && self.current_delay < self.config.rate_limit_floor
        {
            self.current_delay = self.config.rate_limit_floor;
        }

        let delay = self.apply_jitter(self.current_delay);
        self.escalate();
        delay
    }

    /// Number of attempts since the last stable session.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Current un-jittered delay that the next disconnect would wait.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    fn escalate(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.ceiling.as_millis());
        let capped_u64 = u64::try_from(capped).unwrap_or(u64::MAX);
        self.current_delay = Duration::from_millis(capped_u64);
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(floor_ms: u64, ceiling_ms: u64, stable_secs: u64) -> BackoffConfig {
        BackoffConfig {
            floor: Duration::from_millis(floor_ms),
            ceiling: Duration::from_millis(ceiling_ms),
            rate_limit_floor: Duration::from_millis(floor_ms * 10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            stable_uptime: Duration::from_secs(stable_secs),
        }
    }

    #[test]
    fn backoff_escalates_without_streaming() {
        let mut policy = BackoffPolicy::new(no_jitter(100, 10_000, 30));

        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(200)
        );
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(400)
        );
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn backoff_caps_at_ceiling() {
        let mut policy = BackoffPolicy::new(no_jitter(1000, 2000, 30));

        let _ = policy.on_disconnect(DisconnectClass::Transport);
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(2000)
        );
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn unstable_session_does_not_reset() {
        let mut policy = BackoffPolicy::new(no_jitter(100, 10_000, 30));

        let _ = policy.on_disconnect(DisconnectClass::Transport);
        // Streams briefly, well under the 30s stability threshold.
        policy.on_streaming();
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn stable_session_resets_to_floor() {
        let mut policy = BackoffPolicy::new(no_jitter(100, 10_000, 0));

        let _ = policy.on_disconnect(DisconnectClass::Transport);
        let _ = policy.on_disconnect(DisconnectClass::Transport);
        assert_eq!(policy.attempt_count(), 2);

        // stable_uptime of zero: any streaming session counts as stable.
        policy.on_streaming();
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(100)
        );
        assert_eq!(policy.attempt_count(), 1);
    }

    #[test]
    fn rate_limit_uses_larger_floor() {
        let mut policy = BackoffPolicy::new(no_jitter(100, 100_000, 30));

        assert_eq!(
            policy.on_disconnect(DisconnectClass::RateLimited),
            Duration::from_millis(1000)
        );
        // Next transport failure escalates from the raised value.
        assert_eq!(
            policy.on_disconnect(DisconnectClass::Transport),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = BackoffPolicy::new(BackoffConfig {
                floor: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..no_jitter(1000, 10_000, 30)
            });
            let delay = policy.on_disconnect(DisconnectClass::Transport);
            let millis = delay.as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }
}
