// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-connector circuit breaker: opens on a failure-rate threshold, probes
//! with a single request after a cooldown.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate that opens the breaker, over the current window.
    pub failure_rate_threshold: f64,
    /// Minimum observations in the window before the rate is meaningful.
    pub min_samples: u32,
    /// Length of the counting window.
    pub window: Duration,
    /// How long the breaker stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_samples: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    successes: u32,
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    probe_in_flight: bool,
}

/// Process-wide breaker state; counters are thread-safe.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(State {
                phase: Phase::Closed,
                successes: 0,
                failures: 0,
                window_start: now,
                opened_at: now,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may go out right now. In the half-open phase exactly
    /// one probe is admitted at a time.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::Closed => {
                if state.window_start.elapsed() >= self.config.window {
                    state.window_start = Instant::now();
                    state.successes = 0;
                    state.failures = 0;
                }
                true
            }
            Phase::Open => {
                if state.opened_at.elapsed() >= self.config.cooldown {
                    state.phase = Phase::HalfOpen;
                    state.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::HalfOpen => {
                state.phase = Phase::Closed;
                state.successes = 0;
                state.failures = 0;
                state.window_start = Instant::now();
                state.probe_in_flight = false;
            }
            Phase::Closed => state.successes += 1,
            Phase::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::HalfOpen => {
                state.phase = Phase::Open;
                state.opened_at = Instant::now();
                state.probe_in_flight = false;
            }
            Phase::Closed => {
                state.failures += 1;
                let total = state.successes + state.failures;
                let rate = state.failures as f64 / total as f64;
                if total >= self.config.min_samples
                    && rate >= self.config.failure_rate_threshold
                {
                    state.phase = Phase::Open;
                    state.opened_at = Instant::now();
                }
            }
            Phase::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 0.5,
            min_samples: 4,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(10),
        }
    }

    #[test]
    fn opens_on_failure_rate() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            assert!(breaker.check());
            breaker.record_failure();
        }
        assert!(!breaker.check());
    }

    #[test]
    fn stays_closed_under_the_threshold() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..20 {
            assert!(breaker.check());
            breaker.record_success();
        }
        breaker.record_failure();
        assert!(breaker.check());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(!breaker.check());
        std::thread::sleep(Duration::from_millis(15));
        // One probe is admitted, a second concurrent call is not.
        assert!(breaker.check());
        assert!(!breaker.check());
        breaker.record_success();
        assert!(breaker.check());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.check());
        breaker.record_failure();
        assert!(!breaker.check());
    }
}
