//! Multi-dimensional admission control.
//!
//! Each dimension owns a keyed `governor` limiter (GCRA, which behaves as a
//! token bucket whose burst is the bucket capacity). Keyed state lives in a
//! `DashMap`, so buckets are created lazily exactly once per key and checks on
//! different keys never contend. A check never blocks: it either consumes a
//! token or reports the denial.

use crate::config::{RateLimitConfig, RateRule};
use crate::error::{AppError, AppResult};
use crate::metrics::RATE_LIMITED_TOTAL;
use crate::models::{RoomId, UserId};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

/// Longest replenish period used for rules that never refill.
const NEVER_REFILL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Client IP address.
    Ip,
    /// Account identity.
    Account,
    /// One physical connection (socket session, or client IP for HTTP sends).
    Connection,
    /// An (account, room) pair.
    Room,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::Account => "account",
            Dimension::Connection => "connection",
            Dimension::Room => "room",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn quota_for(rule: RateRule) -> Quota {
    let burst = NonZeroU32::new(rule.capacity).unwrap_or(NonZeroU32::MIN);
    // governor multiplies period by burst in nanoseconds; keep that in range.
    let ceiling = Duration::from_nanos(u64::MAX / (u64::from(burst.get()) + 1)).min(NEVER_REFILL);

    let period = if rule.refill_per_second > 0.0 && rule.refill_per_second.is_finite() {
        Duration::from_secs_f64(1.0 / rule.refill_per_second).min(ceiling)
    } else {
        ceiling
    };

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

pub struct RateLimiter {
    ip: DefaultKeyedRateLimiter<String>,
    account: DefaultKeyedRateLimiter<String>,
    connection: DefaultKeyedRateLimiter<String>,
    room: DefaultKeyedRateLimiter<String>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            ip: DefaultKeyedRateLimiter::keyed(quota_for(config.ip)),
            account: DefaultKeyedRateLimiter::keyed(quota_for(config.account)),
            connection: DefaultKeyedRateLimiter::keyed(quota_for(config.connection)),
            room: DefaultKeyedRateLimiter::keyed(quota_for(config.room)),
        }
    }

    fn limiter(&self, dimension: Dimension) -> &DefaultKeyedRateLimiter<String> {
        match dimension {
            Dimension::Ip => &self.ip,
            Dimension::Account => &self.account,
            Dimension::Connection => &self.connection,
            Dimension::Room => &self.room,
        }
    }

    /// Consume one token for `key` in `dimension`; `false` when none is left.
    pub fn allow(&self, dimension: Dimension, key: &str) -> bool {
        self.limiter(dimension).check_key(&key.to_string()).is_ok()
    }

    /// Like [`allow`](Self::allow) but records the denial and maps it to
    /// `AppError::RateLimited`.
    pub fn check(&self, dimension: Dimension, key: &str) -> AppResult<()> {
        if self.allow(dimension, key) {
            return Ok(());
        }
        RATE_LIMITED_TOTAL
            .with_label_values(&[dimension.as_str()])
            .inc();
        warn!(dimension = %dimension, key, "rate limit exceeded");
        Err(AppError::RateLimited(dimension))
    }

    pub fn check_room(&self, account: UserId, room: RoomId) -> AppResult<()> {
        self.check(Dimension::Room, &format!("{account}|{room}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn limiter_with(rule: RateRule) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            ip: rule,
            account: rule,
            connection: rule,
            room: rule,
        })
    }

    #[test]
    fn exhausted_bucket_denies_sixth_call() {
        let limiter = limiter_with(RateRule {
            capacity: 5,
            refill_per_second: 0.0,
        });
        for _ in 0..5 {
            assert!(limiter.allow(Dimension::Connection, "session-1"));
        }
        assert!(!limiter.allow(Dimension::Connection, "session-1"));
        assert!(matches!(
            limiter.check(Dimension::Connection, "session-1"),
            Err(AppError::RateLimited(Dimension::Connection))
        ));
    }

    #[test]
    fn keys_and_dimensions_are_independent() {
        let limiter = limiter_with(RateRule {
            capacity: 1,
            refill_per_second: 0.0,
        });
        assert!(limiter.allow(Dimension::Ip, "10.0.0.1"));
        assert!(!limiter.allow(Dimension::Ip, "10.0.0.1"));
        assert!(limiter.allow(Dimension::Ip, "10.0.0.2"));
        assert!(limiter.allow(Dimension::Account, "10.0.0.1"));

        let user = Uuid::new_v4();
        let room_a = RoomId::Group(Uuid::new_v4());
        let room_b = RoomId::Group(Uuid::new_v4());
        assert!(limiter.check_room(user, room_a).is_ok());
        assert!(limiter.check_room(user, room_a).is_err());
        assert!(limiter.check_room(user, room_b).is_ok());
    }

    #[test]
    fn concurrent_first_use_creates_one_bucket() {
        let limiter = Arc::new(limiter_with(RateRule {
            capacity: 5,
            refill_per_second: 0.0,
        }));
        let granted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let limiter = limiter.clone();
                let granted = granted.clone();
                scope.spawn(move || {
                    for _ in 0..4 {
                        if limiter.allow(Dimension::Account, "alice") {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn fractional_refill_is_accepted() {
        let quota = quota_for(RateRule {
            capacity: 3,
            refill_per_second: 0.5,
        });
        assert_eq!(quota.replenish_interval(), Duration::from_secs(2));
        assert_eq!(quota.burst_size().get(), 3);
    }
}
