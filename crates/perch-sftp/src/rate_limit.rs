//! Authentication rate limiting
//!
//! Failed password attempts are counted per client IP inside a sliding
//! window. Hitting the limit locks the IP out; a locked-out IP is rejected
//! before its credentials are looked at.

use crate::config::RateLimitSettings;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Longest lockout or window honored, about ten years
pub const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
struct AttemptRecord {
    failed_attempts: u32,
    window_start: Instant,
    lockout_until: Option<Instant>,
}

impl AttemptRecord {
    fn new() -> Self {
        Self {
            failed_attempts: 0,
            window_start: Instant::now(),
            lockout_until: None,
        }
    }

    fn is_locked(&self, now: Instant) -> bool {
        self.lockout_until.is_some_and(|until| now < until)
    }

    /// Clear expired lockouts and windows
    fn refresh(&mut self, now: Instant, window: Duration) {
        if self.lockout_until.is_some_and(|until| now >= until) {
            self.lockout_until = None;
            self.failed_attempts = 0;
            self.window_start = now;
        }
        if self.lockout_until.is_none() && now.duration_since(self.window_start) > window {
            self.failed_attempts = 0;
            self.window_start = now;
        }
    }
}

/// Per-IP limiter for failed authentication attempts
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    attempts: Mutex<HashMap<IpAddr, AttemptRecord>>,
}

impl RateLimiter {
    /// Create a rate limiter
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Lockout length applied once the limit is hit
    pub const fn lockout_secs(&self) -> u64 {
        self.settings.lockout_secs
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.settings.window_secs.min(MAX_PERIOD_SECS))
    }

    fn lockout(&self) -> Duration {
        Duration::from_secs(self.settings.lockout_secs.min(MAX_PERIOD_SECS))
    }

    /// Whether `ip` may attempt authentication right now
    pub async fn check_allowed(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock().await;
        let Some(record) = attempts.get_mut(&ip) else {
            return true;
        };

        let now = Instant::now();
        record.refresh(now, self.window());

        if record.is_locked(now) {
            debug!(%ip, "Authentication attempt from locked out IP");
            return false;
        }

        record.failed_attempts < self.settings.max_attempts
    }

    /// Count a failed attempt
    ///
    /// Returns `true` when this failure triggered a lockout.
    pub async fn record_failure(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock().await;
        let record = attempts.entry(ip).or_insert_with(AttemptRecord::new);

        let now = Instant::now();
        record.refresh(now, self.window());
        record.failed_attempts = record.failed_attempts.saturating_add(1);

        debug!(
            %ip,
            failed_attempts = record.failed_attempts,
            max_attempts = self.settings.max_attempts,
            "Failed authentication attempt"
        );

        if record.lockout_until.is_none() && record.failed_attempts >= self.settings.max_attempts {
            record.lockout_until = now.checked_add(self.lockout()).or(Some(now));
            warn!(
                %ip,
                lockout_secs = self.settings.lockout_secs,
                failed_attempts = record.failed_attempts,
                "IP locked out"
            );
            return true;
        }

        false
    }

    /// Forget failures for `ip` after a successful login
    pub async fn record_success(&self, ip: IpAddr) {
        let mut attempts = self.attempts.lock().await;
        if attempts.remove(&ip).is_some() {
            debug!(%ip, "Cleared failed attempts after successful authentication");
        }
    }

    /// Drop records whose window and lockout have both run out
    pub async fn cleanup_expired(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let window = self.window();

        attempts.retain(|_, record| {
            record.is_locked(now) || now.duration_since(record.window_start) <= window
        });
    }

    /// Number of tracked IPs and how many of them are locked out
    pub async fn stats(&self) -> (usize, usize) {
        let attempts = self.attempts.lock().await;
        let now = Instant::now();
        let locked = attempts.values().filter(|r| r.is_locked(now)).count();
        (attempts.len(), locked)
    }
}
