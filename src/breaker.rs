use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Client-side circuit breaker guarding attempts against the daemon.
///
/// Closed is the normal state; `failure_threshold` consecutive failures open
/// the circuit, after `recovery_timeout` one trial attempt is permitted
/// (HalfOpen), and the trial's outcome decides between Closed and Open.
/// `can_attempt()` is the sole gate a caller consults before trying the
/// daemon at all.

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure_time: Option<Instant>,
    last_state_change: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            last_failure_time: None,
            last_state_change: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS),
        )
    }

    /// Whether a daemon attempt is currently permitted. In Open state this
    /// also performs the timed transition to HalfOpen, which admits exactly
    /// one trial attempt.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_state_change
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);

                if elapsed >= self.recovery_timeout {
                    info!("🔁 Recovery window elapsed, permitting one trial attempt");
                    self.transition(BreakerState::HalfOpen);
                    true
                } else {
                    debug!(
                        "⛔ Circuit open, {}s until recovery window",
                        self.recovery_timeout.saturating_sub(elapsed).as_secs()
                    );
                    false
                }
            }
        }
    }

    /// Record a successful daemon exchange.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                info!("✅ Circuit breaker trial succeeded, closing circuit");
                self.failure_count = 0;
                self.transition(BreakerState::Closed);
            }
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::Open => {
                // A success while open means the caller bypassed the gate;
                // treat it as recovery anyway
                self.failure_count = 0;
                self.transition(BreakerState::Closed);
            }
        }
    }

    /// Record a failed daemon exchange.
    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());

        match self.state {
            BreakerState::HalfOpen => {
                warn!("❌ Circuit breaker trial failed, reopening circuit");
                self.transition(BreakerState::Open);
            }
            BreakerState::Closed => {
                self.failure_count += 1;
                debug!(
                    "❌ Daemon failure {}/{}",
                    self.failure_count, self.failure_threshold
                );
                if self.failure_count >= self.failure_threshold {
                    warn!(
                        "⛔ {} consecutive daemon failures, opening circuit for {}s",
                        self.failure_count,
                        self.recovery_timeout.as_secs()
                    );
                    self.transition(BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    fn transition(&mut self, next: BreakerState) {
        debug!("🔀 Circuit breaker: {} -> {}", self.state, next);
        self.state = next;
        self.last_state_change = Some(Instant::now());
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(30))
    }

    #[test]
    fn test_starts_closed_and_permits_attempts() {
        let mut breaker = fast_breaker();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_attempt());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut breaker = fast_breaker();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let mut breaker = fast_breaker();

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        // Two more failures should not open: the streak was broken
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_transitions_to_half_open_after_recovery_timeout() {
        let mut breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.can_attempt());

        thread::sleep(Duration::from_millis(50));

        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // The recovery timer restarted, so the gate is shut again
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let mut breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(breaker.can_attempt());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_attempt());
    }

    #[test]
    fn test_last_failure_time_is_recorded() {
        let mut breaker = fast_breaker();
        assert!(breaker.last_failure_time().is_none());

        breaker.record_failure();
        assert!(breaker.last_failure_time().is_some());
    }

    #[test]
    fn test_threshold_of_zero_is_clamped() {
        let mut breaker = CircuitBreaker::new(0, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
