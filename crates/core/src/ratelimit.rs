//! Per-session token-bucket rate limiting
//!
//! Buckets are ephemeral: created with full burst credit on first
//! touch, discarded on `reset_session` / `cleanup`. Refill arithmetic
//! runs on `Instant` so wall-clock skew can never refund tokens.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Token-bucket configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate
    pub requests_per_minute: f64,
    /// Bucket capacity (instantaneous burst)
    pub burst_size: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60.0,
            burst_size: 10.0,
        }
    }
}

impl RateLimitConfig {
    /// Reject non-positive rates and capacities
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "requests_per_minute must be > 0, got {}",
                self.requests_per_minute
            )));
        }
        if self.burst_size <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "burst_size must be > 0, got {}",
                self.burst_size
            )));
        }
        Ok(())
    }
}

/// Outcome of a consume attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    /// One token consumed
    Allowed,
    /// Bucket exhausted; retry after the given number of seconds
    Limited {
        /// Seconds until one token becomes available
        retry_after: f64,
    },
}

impl RateDecision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-session token buckets with per-group config overrides
pub struct RateLimiter {
    default_config: RateLimitConfig,
    group_configs: RwLock<HashMap<String, RateLimitConfig>>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    /// Limiter with a validated default configuration
    pub fn new(default_config: RateLimitConfig) -> Result<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            group_configs: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Install or replace a per-group configuration.
    ///
    /// Visible to subsequent `try_consume` calls; live buckets keep
    /// their current fill and are not re-keyed.
    pub fn set_group_config(&self, group: &str, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        self.group_configs
            .write()
            .expect("group config lock")
            .insert(group.to_string(), config);
        Ok(())
    }

    /// Drop a per-group configuration, reverting the group to defaults
    pub fn remove_group_config(&self, group: &str) {
        self.group_configs
            .write()
            .expect("group config lock")
            .remove(group);
    }

    fn config_for(&self, group: &str) -> RateLimitConfig {
        self.group_configs
            .read()
            .expect("group config lock")
            .get(group)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Try to consume one token from the session's bucket.
    ///
    /// The bucket is refilled by `elapsed × rate/60`, capped at the
    /// burst size, before the consume is attempted.
    pub fn try_consume(&self, session_id: &str, group: &str) -> RateDecision {
        let config = self.config_for(group);
        let rate_per_sec = config.requests_per_minute / 60.0;
        let now = Instant::now();

        let mut buckets = self.buckets.lock().expect("bucket lock");
        let bucket = buckets
            .entry(session_id.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: config.burst_size,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(config.burst_size);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let retry_after = (1.0 - bucket.tokens) / rate_per_sec;
            tracing::debug!(
                session_id,
                group,
                retry_after,
                "rate limit exceeded for session"
            );
            RateDecision::Limited { retry_after }
        }
    }

    /// Drop the bucket for one session (full burst credit on next touch)
    pub fn reset_session(&self, session_id: &str) {
        self.buckets
            .lock()
            .expect("bucket lock")
            .remove(session_id);
    }

    /// Wipe all bucket state
    pub fn cleanup(&self) {
        self.buckets.lock().expect("bucket lock").clear();
    }
}
