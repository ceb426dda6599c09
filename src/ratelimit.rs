//! Token-bucket rate limiting for inbound connections.

use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_GLOBAL_CONNECTIONS_PER_SECOND: u32 = 100;

pub const DEFAULT_CONNECTIONS_PER_IP_PER_SECOND: u32 = 20;

pub const MAX_TRACKED_IPS: usize = 1000;

/// A refilling bucket; `capacity` tokens, refilled at `rate` tokens per second.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: u32, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            rate: rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    pub(crate) fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub(crate) fn give_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    pub(crate) fn available(&self) -> f64 {
        self.tokens
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub global_per_second: u32,
    pub per_ip_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_second: DEFAULT_GLOBAL_CONNECTIONS_PER_SECOND,
            per_ip_per_second: DEFAULT_CONNECTIONS_PER_IP_PER_SECOND,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    global: TokenBucket,
    per_ip: LruCache<IpAddr, TokenBucket>,
}

/// Admission control for accepted sockets, applied before the handshake runs.
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimitState>,
}

impl ConnectionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let tracked = NonZeroUsize::new(MAX_TRACKED_IPS).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            state: Mutex::new(RateLimitState {
                global: TokenBucket::new(
                    config.global_per_second,
                    config.global_per_second as f64,
                ),
                per_ip: LruCache::new(tracked),
            }),
        }
    }

    pub async fn allow(&self, ip: IpAddr) -> bool {
        let mut state = self.state.lock().await;

        if !state.global.try_consume() {
            return false;
        }

        let per_ip = self.config.per_ip_per_second;
        let ip_bucket = state
            .per_ip
            .get_or_insert_mut(ip, || TokenBucket::new(per_ip, per_ip as f64));

        if !ip_bucket.try_consume() {
            // The global token was not used by an admitted connection.
            state.global.give_back();
            return false;
        }

        true
    }

    pub async fn stats(&self) -> RateLimitStats {
        let state = self.state.lock().await;
        RateLimitStats {
            global_tokens_available: state.global.available(),
            tracked_ips: state.per_ip.len(),
            global_rate_limit: self.config.global_per_second,
            per_ip_rate_limit: self.config.per_ip_per_second,
        }
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub global_tokens_available: f64,
    pub tracked_ips: usize,
    pub global_rate_limit: u32,
    pub per_ip_rate_limit: u32,
}
