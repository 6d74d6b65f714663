//! Per-key cool-down tracking with exponential back-off.
//!
//! Keys are opaque strings of the form `provider:model` or
//! `provider:model:accountIndex`. A key in cool-down is unavailable until
//! its deadline passes; deadlines only ever move forward (jitter extends,
//! never shortens).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;

/// Base cool-down when the upstream did not say how long to wait.
const BASE_COOLDOWN: Duration = Duration::from_secs(30);

/// Upper bound for the doubling back-off.
const MAX_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Strikes older than this no longer influence the doubling.
const STRIKE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Uniform jitter added on top of every deadline.
const JITTER_MAX_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    deadline: Instant,
    strikes: u32,
    last_strike: Instant,
}

/// Process-wide cool-down table. Cheap to clone; all clones share state.
#[derive(Default, Clone)]
pub struct CooldownManager {
    entries: std::sync::Arc<DashMap<String, CooldownEntry>>,
}

impl CooldownManager {
    /// A fresh, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the key is currently usable.
    pub fn is_available(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry.deadline <= Instant::now(),
            None => true,
        }
    }

    /// Record a rate limit for the key and return the effective cool-down in
    /// milliseconds.
    ///
    /// With an upstream-provided `retry_after_ms` the deadline is
    /// `now + retry_after + jitter`; otherwise the 30 s base doubles per
    /// strike recorded within the last hour, capped at 15 minutes.
    pub fn mark_rate_limited(&self, key: &str, retry_after_ms: Option<u64>) -> u64 {
        let now = Instant::now();
        let jitter = Duration::from_millis(rand::rng().random_range(0..JITTER_MAX_MS));

        let mut entry = self.entries.entry(key.to_string()).or_insert(CooldownEntry {
            deadline: now,
            strikes: 0,
            last_strike: now,
        });

        let strikes = if now.duration_since(entry.last_strike) > STRIKE_WINDOW {
            0
        } else {
            entry.strikes
        };

        let base = match retry_after_ms {
            Some(ms) => Duration::from_millis(ms),
            None => BASE_COOLDOWN
                .checked_mul(1u32 << strikes.min(5))
                .unwrap_or(MAX_COOLDOWN)
                .min(MAX_COOLDOWN),
        };

        let effective = base + jitter;

        entry.deadline = now + effective;
        entry.strikes = strikes + 1;
        entry.last_strike = now;

        log::debug!(
            "Cool-down for '{key}': {}ms (strike {})",
            effective.as_millis(),
            entry.strikes
        );

        effective.as_millis() as u64
    }

    /// Remaining cool-down in milliseconds; 0 when available.
    pub fn get_reset_time(&self, key: &str) -> u64 {
        match self.entries.get(key) {
            Some(entry) => entry
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            None => 0,
        }
    }

    /// Drop the entry for a key.
    pub fn clear(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Extract a retry delay from a 429 response.
///
/// Accepts, in order: a decimal `Retry-After` header (seconds), an HTTP-date
/// `Retry-After` header, and JSON bodies shaped
/// `{"error": {"retry_after_ms" | "retry_after_seconds" | "retryAfter": n}}`.
pub fn parse_retry_after(header: Option<&str>, body: &str) -> Option<u64> {
    if let Some(value) = header {
        let value = value.trim();

        if let Ok(seconds) = value.parse::<u64>() {
            return Some(seconds * 1000);
        }

        if let Ok(date) = jiff::fmt::rfc2822::DateTimeParser::new().parse_timestamp(value) {
            let now = jiff::Timestamp::now();
            let ms = date.as_millisecond().saturating_sub(now.as_millisecond());
            if ms > 0 {
                return Some(ms as u64);
            }
        }
    }

    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    if let Some(ms) = error.get("retry_after_ms").and_then(Value::as_u64) {
        return Some(ms);
    }

    if let Some(seconds) = error.get("retry_after_seconds").and_then(Value::as_u64) {
        return Some(seconds * 1000);
    }

    if let Some(retry) = error.get("retryAfter") {
        if let Some(seconds) = retry.as_u64() {
            return Some(seconds * 1000);
        }
        if let Some(text) = retry.as_str()
            && let Ok(seconds) = text.trim().parse::<u64>()
        {
            return Some(seconds * 1000);
        }
    }

    None
}
