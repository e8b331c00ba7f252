//! Per-IP rate limiting
//!
//! A bounded cache of token buckets keyed by remote IP. The cache sweeps
//! expired entries on every lookup and evicts the least recently seen entry
//! when full, so memory stays bounded no matter how many distinct peers
//! connect.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A standalone token bucket: `burst` capacity, one token refilled every
/// `per` interval. `allow` never blocks.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(per: Duration, burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            rate: 1.0 / per.as_secs_f64(),
            last: now,
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct CacheEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Fixed-capacity map from remote IP to token bucket.
pub struct IpLimiterCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    per: Duration,
    burst: u32,
}

impl IpLimiterCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 100_000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
    /// One token every 200 ms with burst 20, roughly 5 sessions/s per IP.
    pub const DEFAULT_REFILL: Duration = Duration::from_millis(200);
    pub const DEFAULT_BURST: u32 = 20;

    pub fn new(max_entries: usize, ttl: Duration, per: Duration, burst: u32) -> Self {
        let max_entries = if max_entries == 0 { 10_000 } else { max_entries };
        let ttl = if ttl.is_zero() {
            Self::DEFAULT_TTL
        } else {
            ttl
        };
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            ttl,
            per,
            burst,
        }
    }

    /// Consult (creating if needed) the bucket for `ip` and take a token.
    ///
    /// Sweeps entries idle past the TTL first; at capacity the entry with
    /// the oldest `last_seen` is evicted to make room.
    pub fn allow(&self, ip: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();

        let cutoff = now.checked_sub(self.ttl);
        if let Some(cutoff) = cutoff {
            entries.retain(|_, e| e.last_seen >= cutoff);
        }

        if let Some(entry) = entries.get_mut(ip) {
            entry.last_seen = now;
            return entry.bucket.allow(now);
        }

        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(ip, _)| ip.clone())
            {
                entries.remove(&oldest);
            }
        }

        let mut bucket = TokenBucket::new(self.per, self.burst, now);
        let allowed = bucket.allow(now);
        entries.insert(
            ip.to_string(),
            CacheEntry {
                bucket,
                last_seen: now,
            },
        );
        allowed
    }

    /// Current number of tracked IPs, exported as a gauge.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IpLimiterCache {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ENTRIES,
            Self::DEFAULT_TTL,
            Self::DEFAULT_REFILL,
            Self::DEFAULT_BURST,
        )
    }
}
