// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Time utilities.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A validity window anchored at its creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationData {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ExpirationData {
    /// A window starting now and lasting for the given duration.
    pub fn now(validity: Duration) -> Self {
        let not_before = Utc::now();
        Self {
            not_before,
            not_after: not_before + validity,
        }
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn validity_period(&self) -> Duration {
        self.not_after - self.not_before
    }

    pub fn is_expired_at(&self, time: DateTime<Utc>) -> bool {
        time >= self.not_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_expires() {
        let window = ExpirationData::now(Duration::minutes(5));
        assert!(!window.is_expired_at(window.not_before()));
        assert!(window.is_expired_at(window.not_after() + Duration::seconds(1)));
        assert_eq!(window.validity_period(), Duration::minutes(5));
    }
}
