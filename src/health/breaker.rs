use crate::config::HealthConfig;
use rand::{RngExt, rng};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}
impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
    pub consecutive_successes: usize,
}

// Pure circuit-breaker state machine. Only the health-probe task mutates it;
// everyone else reads snapshots. Time is passed in, never sampled here.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: usize,
    recovery_timeout: Duration,
    recovery_confirmation_threshold: usize,
    backoff_base_multiplier: f64,
    backoff_jitter_range: (f64, f64),
    max_backoff_interval: Duration,

    state: BreakerState,
    failure_count: usize,
    consecutive_successes: usize,
    open_count: u32,
    next_probe_at: Option<Instant>,
}
impl CircuitBreaker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            recovery_confirmation_threshold: config.recovery_confirmation_threshold,
            backoff_base_multiplier: config.backoff_base_multiplier,
            backoff_jitter_range: config.backoff_jitter_range,
            max_backoff_interval: config.max_backoff_interval,

            state: BreakerState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            open_count: 0,
            next_probe_at: None,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            consecutive_successes: self.consecutive_successes,
        }
    }
    pub fn state(&self) -> BreakerState {
        self.state
    }

    fn recovery_delay(&self) -> Duration {
        let backoff = self
            .recovery_timeout
            .mul_f64(
                self.backoff_base_multiplier
                    .powi(self.open_count.saturating_sub(1) as i32),
            );
        let (jitter_min, jitter_max) = self.backoff_jitter_range;
        let jittered = backoff.mul_f64(rng().random_range(jitter_min..=jitter_max));
        jittered.min(self.max_backoff_interval)
    }

    fn open(
        &mut self,
        now: Instant,
    ) {
        self.state = BreakerState::Open;
        self.consecutive_successes = 0;
        self.open_count += 1;
        self.next_probe_at = Some(now + self.recovery_delay());
    }

    // Gates a probe attempt. While Open, probes stay blocked until the
    // recovery delay elapses; the first permitted probe moves to HalfOpen.
    pub fn allow_probe(
        &mut self,
        now: Instant,
    ) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let due = self
                    .next_probe_at
                    .map(|next_probe_at| now >= next_probe_at)
                    .unwrap_or(true);
                if due {
                    self.state = BreakerState::HalfOpen;
                    self.consecutive_successes = 0;
                }
                due
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.recovery_confirmation_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.consecutive_successes = 0;
                    self.open_count = 0;
                    self.next_probe_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }
    pub fn record_failure(
        &mut self,
        now: Instant,
    ) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.open(now);
                }
            }
            BreakerState::HalfOpen => {
                self.failure_count += 1;
                self.open(now);
            }
            BreakerState::Open => {}
        }
    }
}
