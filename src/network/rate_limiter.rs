// src/network/rate_limiter.rs
// Token bucket per identifier with reputation-scaled capacity, a global
// circuit breaker and explicit bans.
//
// Keys are free-form; callers use `ip:<addr>` and `peer:<node>:<msg-type>`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const BREAKER_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    /// Positive whenever `allowed` is false.
    pub retry_after_ms: u64,
    pub remaining: f64,
}

impl RateDecision {
    fn allow(remaining: f64) -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            remaining,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after_ms: (retry_after.as_millis() as u64).max(1),
            remaining: 0.0,
        }
    }
}

pub fn ip_key(addr: &std::net::IpAddr) -> String {
    format!("ip:{}", addr)
}

pub fn peer_key(node_id: &str, msg_type: &str) -> String {
    format!("peer:{}:{}", node_id, msg_type)
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    reputation: f64,
}

struct Breaker {
    window_start: Instant,
    count: u64,
    tripped_until: Option<Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
    bans: DashMap<String, Instant>,
    breaker: Mutex<Breaker>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            bans: DashMap::new(),
            breaker: Mutex::new(Breaker {
                window_start: Instant::now(),
                count: 0,
                tripped_until: None,
            }),
        }
    }

    fn effective_capacity(&self, reputation: f64) -> f64 {
        ((self.config.capacity + self.config.burst) * reputation).max(1.0)
    }

    pub fn check(&self, key: &str, cost: f64) -> RateDecision {
        self.check_at(key, cost, Instant::now())
    }

    pub fn check_at(&self, key: &str, cost: f64, now: Instant) -> RateDecision {
        if let Some(until) = self.ban_expiry_at(key, now) {
            return RateDecision::deny(until.saturating_duration_since(now));
        }
        if let Some(wait) = self.breaker_at(now) {
            return RateDecision::deny(wait);
        }

        let full = self.effective_capacity(1.0);
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: full,
            last_refill: now,
            reputation: 1.0,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.reputation =
            (bucket.reputation + elapsed * self.config.reputation_recovery_per_sec).min(1.0);
        let cap = self.effective_capacity(bucket.reputation);
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec).min(cap);
        bucket.last_refill = now;

        if bucket.tokens + 1e-9 >= cost {
            bucket.tokens = (bucket.tokens - cost).max(0.0);
            return RateDecision::allow(bucket.tokens);
        }

        bucket.reputation = (bucket.reputation - self.config.violation_penalty).max(0.0);
        let deficit = cost - bucket.tokens;
        let refill = self.config.refill_per_sec.max(1e-6);
        RateDecision::deny(Duration::from_secs_f64(deficit / refill))
    }

    /// Aggregate load across all keys. Returns the remaining cooldown when the
    /// breaker is (or just became) open.
    fn breaker_at(&self, now: Instant) -> Option<Duration> {
        let mut b = self.breaker.lock();
        if let Some(until) = b.tripped_until {
            if now < until {
                return Some(until - now);
            }
            b.tripped_until = None;
            b.window_start = now;
            b.count = 0;
            log::info!("rate limiter circuit breaker closed");
        }
        if now.saturating_duration_since(b.window_start) >= BREAKER_WINDOW {
            b.window_start = now;
            b.count = 0;
        }
        b.count += 1;
        if b.count > self.config.breaker_threshold {
            let cooldown = Duration::from_millis(self.config.breaker_cooldown_ms);
            b.tripped_until = Some(now + cooldown);
            log::warn!(
                "rate limiter circuit breaker tripped: {} requests in {:?}, cooling down {:?}",
                b.count,
                BREAKER_WINDOW,
                cooldown
            );
            return Some(cooldown);
        }
        None
    }

    pub fn breaker_open_at(&self, now: Instant) -> bool {
        matches!(self.breaker.lock().tripped_until, Some(until) if now < until)
    }

    /// Knock reputation down for misbehavior the bucket itself cannot see,
    /// such as an invalid signature.
    pub fn record_violation(&self, key: &str) {
        if let Some(mut b) = self.buckets.get_mut(key) {
            b.reputation = (b.reputation - self.config.violation_penalty).max(0.0);
        } else {
            self.buckets.insert(
                key.to_string(),
                Bucket {
                    tokens: self.effective_capacity(1.0),
                    last_refill: Instant::now(),
                    reputation: (1.0 - self.config.violation_penalty).max(0.0),
                },
            );
        }
    }

    pub fn reputation(&self, key: &str) -> f64 {
        self.buckets.get(key).map(|b| b.reputation).unwrap_or(1.0)
    }

    pub fn ban(&self, key: &str, duration: Duration) {
        self.ban_at(key, duration, Instant::now())
    }

    pub fn ban_at(&self, key: &str, duration: Duration, now: Instant) {
        log::warn!("banning {} for {:?}", key, duration);
        self.bans.insert(key.to_string(), now + duration);
    }

    pub fn unban(&self, key: &str) -> bool {
        let removed = self.bans.remove(key).is_some();
        if removed {
            if let Some(mut b) = self.buckets.get_mut(key) {
                b.reputation = b.reputation.max(0.5);
            }
            log::info!("unbanned {}", key);
        }
        removed
    }

    pub fn is_banned(&self, key: &str) -> bool {
        self.ban_expiry_at(key, Instant::now()).is_some()
    }

    fn ban_expiry_at(&self, key: &str, now: Instant) -> Option<Instant> {
        let until = *self.bans.get(key)?;
        if now < until {
            Some(until)
        } else {
            self.bans.remove(key);
            None
        }
    }

    /// Forget fully recovered idle buckets and lapsed bans.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            now.saturating_duration_since(b.last_refill) < ttl || b.reputation < 1.0
        });
        self.bans.retain(|_, until| now < *until);
        before - self.buckets.len()
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
