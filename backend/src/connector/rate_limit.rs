// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-recipient rate limiter.

use std::{collections::HashMap, sync::Mutex};

use chrono::TimeDelta;
use sqlx::types::chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub time_window: TimeDelta,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 600,
            time_window: TimeDelta::minutes(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Allowance {
    remaining: u64,
    valid_until: DateTime<Utc>,
}

impl Allowance {
    fn new(config: &RateLimitConfig) -> Self {
        Allowance {
            remaining: config.max_requests,
            valid_until: Utc::now() + config.time_window,
        }
    }

    fn reset(&mut self, config: &RateLimitConfig) {
        self.remaining = config.max_requests;
        self.valid_until = Utc::now() + config.time_window;
    }

    fn allowed(&mut self, config: &RateLimitConfig) -> bool {
        // Check if the time window has passed
        if self.valid_until < Utc::now() {
            self.reset(config);
        }

        if self.remaining == 0 {
            false
        } else {
            self.remaining -= 1;
            true
        }
    }
}

/// Keyed token allowances; a key is one recipient handle.
#[derive(Debug)]
pub struct RecipientRateLimiter {
    config: RateLimitConfig,
    allowances: Mutex<HashMap<String, Allowance>>,
}

impl RecipientRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            allowances: Mutex::new(HashMap::new()),
        }
    }

    pub fn allowed(&self, key: &str) -> bool {
        let mut allowances = self.allowances.lock().unwrap();
        let allowance = allowances
            .entry(key.to_owned())
            .or_insert_with(|| Allowance::new(&self.config));
        allowance.allowed(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_recovers() {
        let limiter = RecipientRateLimiter::new(RateLimitConfig {
            max_requests: 2,
            time_window: TimeDelta::milliseconds(-1),
        });
        // A window in the past resets on every call.
        assert!(limiter.allowed("a"));
        assert!(limiter.allowed("a"));
        assert!(limiter.allowed("a"));

        let limiter = RecipientRateLimiter::new(RateLimitConfig {
            max_requests: 2,
            time_window: TimeDelta::minutes(1),
        });
        assert!(limiter.allowed("a"));
        assert!(limiter.allowed("a"));
        assert!(!limiter.allowed("a"));
        // Budgets are per recipient.
        assert!(limiter.allowed("b"));
    }
}
