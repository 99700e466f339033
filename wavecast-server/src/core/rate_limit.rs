use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::ChatConfig;

/// Two strings count as the same message when their similarity exceeds this.
const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Texts shorter than this (after normalization) skip duplicate detection;
/// one-word reactions repeat legitimately in a live chat.
const DUPLICATE_MIN_CHARS: usize = 4;

/// How often the background reaper scans the record table, in seconds.
pub(crate) const REAPER_INTERVAL_SECS: u64 = 300;

/// Wire code attached to a denied message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyCode {
    Timeout,
    MessageTooLong,
    RateLimit,
    SpamDetected,
    HeavySpam,
    RateLimitLongMessage,
    RateLimitMediumMessage,
    DuplicateSpam,
    HeavyTextSpam,
    RepeatOffender,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::MessageTooLong => "MESSAGE_TOO_LONG",
            Self::RateLimit => "RATE_LIMIT",
            Self::SpamDetected => "SPAM_DETECTED",
            Self::HeavySpam => "HEAVY_SPAM",
            Self::RateLimitLongMessage => "RATE_LIMIT_LONG_MESSAGE",
            Self::RateLimitMediumMessage => "RATE_LIMIT_MEDIUM_MESSAGE",
            Self::DuplicateSpam => "DUPLICATE_SPAM",
            Self::HeavyTextSpam => "HEAVY_TEXT_SPAM",
            Self::RepeatOffender => "REPEAT_OFFENDER",
        }
    }
}

/// Outcome of a rate-limit check. Exactly one variant per call; the tier
/// ordering inside [`RateLimiter::check_at`] is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny {
        code: DenyCode,
        /// End of the penalty window, when the tier imposes one.
        timeout_until: Option<DateTime<Utc>>,
        /// Violation count after this check, for roster bookkeeping.
        violations: u32,
    },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Per-user sliding-window state. The three history vectors run in parallel:
/// one entry per allowed message. Denied attempts are never recorded.
#[derive(Debug)]
struct UserRecord {
    timestamps: Vec<DateTime<Utc>>,
    texts: Vec<String>,
    lengths: Vec<usize>,
    timeout_until: Option<DateTime<Utc>>,
    violations: u32,
    last_cleanup: DateTime<Utc>,
    last_message_at: DateTime<Utc>,
}

impl UserRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: Vec::new(),
            texts: Vec::new(),
            lengths: Vec::new(),
            timeout_until: None,
            violations: 0,
            last_cleanup: now,
            last_message_at: now,
        }
    }

    /// Drop history older than five minutes, at most once per minute.
    fn maybe_cleanup(&mut self, now: DateTime<Utc>) {
        if now - self.last_cleanup <= Duration::seconds(60) {
            return;
        }
        let cutoff = now - Duration::minutes(5);
        let keep: Vec<usize> = (0..self.timestamps.len())
            .filter(|&i| self.timestamps[i] > cutoff)
            .collect();
        if keep.len() < self.timestamps.len() {
            self.timestamps = keep.iter().map(|&i| self.timestamps[i]).collect();
            self.texts = keep.iter().map(|&i| self.texts[i].clone()).collect();
            self.lengths = keep.iter().map(|&i| self.lengths[i]).collect();
        }
        self.last_cleanup = now;
    }

    fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.timestamps.iter().filter(|&&t| t > cutoff).count()
    }

    fn chars_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.timestamps
            .iter()
            .zip(&self.lengths)
            .filter(|&(&t, _)| t > cutoff)
            .map(|(_, &len)| len)
            .sum()
    }

    fn record(&mut self, now: DateTime<Utc>, text: &str, len: usize) {
        self.timestamps.push(now);
        self.texts.push(text.to_string());
        self.lengths.push(len);
        self.last_message_at = now;
    }
}

/// Multi-tier per-user rate limiter with escalating penalties.
///
/// The verdict is a function of the user's recorded history, the clock and
/// the incoming text; the per-user record is the only mutable state and is
/// guarded by its own lock, separate from all room locks.
pub struct RateLimiter {
    users: RwLock<HashMap<String, Arc<Mutex<UserRecord>>>>,
    max_chars_per_message: usize,
    heavy_spam_threshold: usize,
    heavy_spam_timeout_minutes: i64,
}

impl RateLimiter {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            max_chars_per_message: config.max_chars_per_message,
            heavy_spam_threshold: config.spam_threshold_messages,
            heavy_spam_timeout_minutes: config.spam_timeout_minutes as i64,
        }
    }

    /// Check an incoming message against every tier at the current time.
    pub fn check(&self, user_id: &str, text: &str) -> Verdict {
        self.check_at(user_id, text, Utc::now())
    }

    /// Tier evaluation core. First match wins; the order below is load-bearing.
    pub fn check_at(&self, user_id: &str, text: &str, now: DateTime<Utc>) -> Verdict {
        let record = self.record_for(user_id, now);
        let mut rec = record.lock();

        // T0: active hard timeout
        if let Some(until) = rec.timeout_until {
            if now < until {
                return Verdict::Deny {
                    code: DenyCode::Timeout,
                    timeout_until: Some(until),
                    violations: rec.violations,
                };
            }
        }

        // T1: oversize
        let len = text.chars().count();
        if len > self.max_chars_per_message {
            return Verdict::Deny {
                code: DenyCode::MessageTooLong,
                timeout_until: None,
                violations: rec.violations,
            };
        }

        rec.maybe_cleanup(now);

        let in_10s = rec.count_since(now - Duration::seconds(10));
        let in_30s = rec.count_since(now - Duration::seconds(30));
        let in_60s = rec.count_since(now - Duration::seconds(60));

        // T2a: burst
        if in_10s >= 5 {
            return Self::penalize(&mut rec, DenyCode::RateLimit, now + Duration::seconds(30), 1);
        }
        // T2b: sustained spam
        if in_30s >= 10 {
            return Self::penalize(&mut rec, DenyCode::SpamDetected, now + Duration::minutes(2), 1);
        }
        // T2c: heavy spam
        if in_60s >= self.heavy_spam_threshold {
            return Self::penalize(
                &mut rec,
                DenyCode::HeavySpam,
                now + Duration::minutes(self.heavy_spam_timeout_minutes),
                2,
            );
        }

        // T3: long messages sent too close together
        if len > 300 && in_10s >= 1 {
            return Verdict::Deny {
                code: DenyCode::RateLimitLongMessage,
                timeout_until: None,
                violations: rec.violations,
            };
        }
        if len > 100 && in_10s >= 3 {
            return Verdict::Deny {
                code: DenyCode::RateLimitMediumMessage,
                timeout_until: None,
                violations: rec.violations,
            };
        }

        // T4: duplicate detection over the last five messages. The candidate
        // counts as one of the copies, so the third identical send is denied.
        if normalized_len(text) >= DUPLICATE_MIN_CHARS {
            let copies = 1 + rec
                .texts
                .iter()
                .rev()
                .take(5)
                .filter(|prior| similarity(prior, text) > SIMILARITY_THRESHOLD)
                .count();
            if copies >= 3 {
                return Self::penalize(
                    &mut rec,
                    DenyCode::DuplicateSpam,
                    now + Duration::minutes(5),
                    1,
                );
            }
        }

        // T5: raw text volume
        if len >= 400 && rec.chars_since(now - Duration::minutes(5)) > 2000 {
            return Self::penalize(
                &mut rec,
                DenyCode::HeavyTextSpam,
                now + Duration::minutes(10),
                2,
            );
        }

        // Escalation for repeat offenders
        if rec.violations >= 3 {
            let penalty = match rec.violations {
                v if v >= 5 => Duration::minutes(30),
                4 => Duration::minutes(10),
                _ => Duration::minutes(5),
            };
            rec.timeout_until = Some(now + penalty);
            return Verdict::Deny {
                code: DenyCode::RepeatOffender,
                timeout_until: rec.timeout_until,
                violations: rec.violations,
            };
        }

        rec.record(now, text, len);
        Verdict::Allow
    }

    /// Remaining seconds of an active timeout, if any. Used on `join` to tell
    /// a reconnecting user they are still muted.
    pub fn active_timeout_secs(&self, user_id: &str) -> Option<i64> {
        self.active_timeout_secs_at(user_id, Utc::now())
    }

    pub fn active_timeout_secs_at(&self, user_id: &str, now: DateTime<Utc>) -> Option<i64> {
        let record = self.users.read().get(user_id)?.clone();
        let rec = record.lock();
        rec.timeout_until
            .filter(|&until| until > now)
            .map(|until| (until - now).num_seconds())
    }

    /// Drop records whose last allowed message is older than 30 minutes.
    pub fn reap_inactive(&self) -> usize {
        self.reap_inactive_at(Utc::now())
    }

    pub fn reap_inactive_at(&self, now: DateTime<Utc>) -> usize {
        let mut users = self.users.write();
        let before = users.len();
        users.retain(|_, record| now - record.lock().last_message_at <= Duration::minutes(30));
        let reaped = before - users.len();
        if reaped > 0 {
            debug!("reaped {} inactive rate-limit records", reaped);
        }
        reaped
    }

    pub fn tracked_users(&self) -> usize {
        self.users.read().len()
    }

    fn record_for(&self, user_id: &str, now: DateTime<Utc>) -> Arc<Mutex<UserRecord>> {
        if let Some(record) = self.users.read().get(user_id) {
            return record.clone();
        }
        let mut users = self.users.write();
        users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserRecord::new(now))))
            .clone()
    }

    fn penalize(
        rec: &mut UserRecord,
        code: DenyCode,
        until: DateTime<Utc>,
        violation_delta: u32,
    ) -> Verdict {
        rec.violations += violation_delta;
        rec.timeout_until = Some(until);
        Verdict::Deny {
            code,
            timeout_until: Some(until),
            violations: rec.violations,
        }
    }
}

fn normalized_len(text: &str) -> usize {
    text.trim().chars().count()
}

/// Cheap positional similarity: normalized equality scores 1.0, otherwise the
/// count of positions with matching characters over the longer length.
fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let matches = a.chars().zip(b.chars()).filter(|(x, y)| x == y).count();
    let longer = a.chars().count().max(b.chars().count());
    matches as f64 / longer as f64
}
