//! Token-auth rate limiter for the control channel.
//!
//! Failures are tracked per `(client_ip, token_prefix)`. Hitting
//! `max_attempts` failures inside the attempts window blocks the pair for
//! `block_duration`; a success deletes the record. A background sweeper
//! drops records whose block expired and whose last attempt is older than
//! twice the block duration.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub block_duration: Duration,
    pub attempts_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            block_duration: Duration::from_secs(5 * 60),
            attempts_window: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug)]
struct AttemptRecord {
    count: u32,
    window_start: Instant,
    last_attempt: Instant,
    blocked_until: Option<Instant>,
}

type Key = (IpAddr, String);

pub struct AuthRateLimiter {
    cfg: RateLimitConfig,
    state: Mutex<HashMap<Key, AttemptRecord>>,
}

/// First characters of the token used as the limiter key, so the full
/// secret never sits in limiter state.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

impl AuthRateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Is this pair currently blocked?
    pub fn is_blocked(&self, ip: IpAddr, prefix: &str) -> bool {
        let state = self.state.lock().unwrap();
        match state.get(&(ip, prefix.to_string())) {
            Some(rec) => rec.blocked_until.is_some_and(|until| Instant::now() < until),
            None => false,
        }
    }

    /// Record a failed attempt. Returns true when this failure triggered a
    /// new block (callers audit-log that transition).
    pub fn record_failure(&self, ip: IpAddr, prefix: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let rec = state
            .entry((ip, prefix.to_string()))
            .or_insert_with(|| AttemptRecord {
                count: 0,
                window_start: now,
                last_attempt: now,
                blocked_until: None,
            });

        // Stale window with no live block: start counting fresh.
        let block_live = rec.blocked_until.is_some_and(|until| now < until);
        if !block_live && now.duration_since(rec.window_start) > self.cfg.attempts_window {
            rec.count = 0;
            rec.window_start = now;
            rec.blocked_until = None;
        }

        rec.count += 1;
        rec.last_attempt = now;

        if rec.count >= self.cfg.max_attempts && rec.blocked_until.is_none() {
            rec.blocked_until = Some(now + self.cfg.block_duration);
            tracing::warn!(%ip, prefix, failures = rec.count, "Auth rate limit block triggered");
            return true;
        }
        false
    }

    /// A successful authentication clears the record entirely.
    pub fn record_success(&self, ip: IpAddr, prefix: &str) {
        self.state.lock().unwrap().remove(&(ip, prefix.to_string()));
    }

    /// Drop records whose block has expired and whose last attempt is
    /// outside `2 × block_duration`.
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale_after = self.cfg.block_duration * 2;
        let mut state = self.state.lock().unwrap();
        let before = state.len();
        state.retain(|_, rec| {
            let block_live = rec.blocked_until.is_some_and(|until| now < until);
            block_live || now.duration_since(rec.last_attempt) <= stale_after
        });
        let removed = before - state.len();
        if removed > 0 {
            tracing::debug!(removed, "Rate limiter sweep");
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

/// Background sweeper, one per limiter. Runs every minute.
pub fn start_sweeper(limiter: Arc<AuthRateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            limiter.sweep();
        }
    })
}
