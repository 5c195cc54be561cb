use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::errors::ChatError;

type KeyedLimiter = RateLimiter<i64, DefaultKeyedStateStore<i64>, DefaultClock>;

/// Outcome of a rate-limit check. `retry_after` is the seconds until one
/// token becomes available and is only meaningful when `allowed` is false.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: f64,
}

/// Per-user token bucket over message sends. Refills at
/// `messages_per_minute / 60` tokens per second up to `burst_size`; each
/// message costs one token. Buckets are created lazily per user and the
/// keyed store is internally synchronized, so concurrent sends from one
/// user cannot both spend the last token.
pub struct MessageRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl MessageRateLimiter {
    pub fn new(messages_per_minute: u32, burst_size: u32) -> Result<Self, ChatError> {
        let per_minute = NonZeroU32::new(messages_per_minute).ok_or_else(|| {
            ChatError::Config("rate_limit.messages_per_minute must be at least 1".to_string())
        })?;
        let burst = NonZeroU32::new(burst_size).ok_or_else(|| {
            ChatError::Config("rate_limit.burst_size must be at least 1".to_string())
        })?;

        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        Ok(Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        })
    }

    /// Spends one token for `user_id` if available. Denied calls consume
    /// nothing and report how long until the bucket next yields a token.
    pub fn check_and_consume(&self, user_id: i64) -> RateDecision {
        match self.limiter.check_key(&user_id) {
            Ok(_) => RateDecision {
                allowed: true,
                retry_after: 0.0,
            },
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(self.clock.now()).as_secs_f64();
                RateDecision {
                    allowed: false,
                    retry_after,
                }
            }
        }
    }
}
