// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock Domain Model
//!
//! Token-based exclusive locks over shared resources. At most one live
//! lock exists per resource at any time; a lock stays live until released
//! with its matching token or until the reaper declares it stale.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Opaque proof of ownership, required for release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    pub holder_id: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    /// Advisory holder lifetime; the reaper enforces `max_lock_age`
    /// independently of it.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Lock {
    pub fn new(
        resource_id: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            holder_id: holder_id.into(),
            token: LockToken::new(),
            acquired_at: Utc::now(),
            ttl,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Stale once its age exceeds the configured maximum holder lifetime
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let max = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
        now - self.acquired_at > max
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Resource '{resource_id}' is already held by '{holder_id}'")]
    AlreadyHeld {
        resource_id: String,
        holder_id: String,
    },

    #[error("Invalid token for resource '{0}'")]
    InvalidToken(String),

    #[error("No lock held on resource '{0}'")]
    NotHeld(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_staleness() {
        let mut lock = Lock::new("resource-1", "holder-a", Duration::from_secs(60));
        let now = Utc::now();
        assert!(!lock.is_stale(now, Duration::from_secs(300)));

        lock.acquired_at = now - ChronoDuration::seconds(301);
        assert!(lock.is_stale(now, Duration::from_secs(300)));
        assert!(lock.age(now) >= Duration::from_secs(301));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = Lock::new("r", "h", Duration::from_secs(1));
        let b = Lock::new("r", "h", Duration::from_secs(1));
        assert_ne!(a.token, b.token);
    }
}
