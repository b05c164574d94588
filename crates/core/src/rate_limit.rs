//! Sliding-window admission control in three tiers: one global bucket, one
//! bucket per user, and one bucket per (user, command class).
//!
//! Each bucket keeps the instants of its admissions inside the current window,
//! so the window slides exactly instead of resetting at fixed boundaries.
//! Every tier is checked and recorded under one lock, so a request is either
//! counted in all of its buckets or in none.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Opportunistic sweep of idle buckets every this many admission checks.
const SWEEP_EVERY: u64 = 1_024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_window(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitTier {
    Global,
    User,
    Command,
}

impl LimitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Command => "command",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    /// Shared by every user; `None` turns the tier off.
    pub global_limit: Option<RateLimit>,
    /// Per user across all commands; `None` turns the tier off.
    pub user_limit: Option<RateLimit>,
    pub default_limit: RateLimit,
    pub class_limits: HashMap<String, RateLimit>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let class_limits = [
            ("/dona-task", 10),
            ("/dona-remind", 20),
            ("/dona-summary", 10),
            ("/dona-metrics", 5),
        ]
        .into_iter()
        .map(|(class, max)| (class.to_owned(), RateLimit::per_window(max, minute)))
        .collect();

        Self {
            enabled: true,
            global_limit: Some(RateLimit::per_window(1_000, minute)),
            user_limit: Some(RateLimit::per_window(60, minute)),
            default_limit: RateLimit::per_window(30, minute),
            class_limits,
        }
    }
}

impl RateLimitPolicy {
    /// A policy with only the per-command tier.
    pub fn per_command(default_limit: RateLimit, class_limits: HashMap<String, RateLimit>) -> Self {
        Self { enabled: true, global_limit: None, user_limit: None, default_limit, class_limits }
    }

    pub fn limit_for(&self, class: &str) -> RateLimit {
        self.class_limits.get(class).copied().unwrap_or(self.default_limit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// `remaining` is the tightest headroom across the checked tiers.
    Admit { remaining: u32 },
    Deny { tier: LimitTier, retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitUsage {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window: Duration,
    /// Time until the oldest admission leaves the window; zero when unused.
    pub resets_in: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum BucketKey {
    Global,
    User(String),
    Command { user: String, class: String },
}

#[derive(Debug)]
struct Bucket {
    admissions: VecDeque<Instant>,
    window: Duration,
}

impl Bucket {
    fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.admissions.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn resets_in(&self, now: Instant) -> Duration {
        self.admissions
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy, buckets: Mutex::new(HashMap::new()), checks: AtomicU64::new(0) }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn try_admit(&self, user: &str, class: &str, now: Instant) -> Admission {
        if !self.policy.enabled {
            return Admission::Admit { remaining: u32::MAX };
        }

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_idle(now);
        }

        let tiers: Vec<(LimitTier, BucketKey, RateLimit)> = [
            (LimitTier::Global, BucketKey::Global, self.policy.global_limit),
            (LimitTier::User, BucketKey::User(user.to_owned()), self.policy.user_limit),
            (
                LimitTier::Command,
                BucketKey::Command { user: user.to_owned(), class: class.to_owned() },
                Some(self.policy.limit_for(class)),
            ),
        ]
        .into_iter()
        .filter_map(|(tier, key, limit)| limit.map(|limit| (tier, key, limit)))
        .collect();

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut remaining = u32::MAX;
        for (tier, key, limit) in &tiers {
            let used = match buckets.get_mut(key) {
                Some(bucket) => {
                    bucket.window = limit.window;
                    bucket.evict_expired(now);
                    bucket.admissions.len() as u32
                }
                None => 0,
            };

            if used >= limit.max_requests {
                let retry_after = buckets
                    .get(key)
                    .map(|bucket| bucket.resets_in(now))
                    .unwrap_or_default()
                    .max(Duration::from_millis(1));
                debug!(
                    event_name = "core.rate_limit.denied",
                    user,
                    class,
                    tier = tier.as_str(),
                    used,
                    limit = limit.max_requests,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit denied request"
                );
                return Admission::Deny { tier: *tier, retry_after };
            }
            remaining = remaining.min(limit.max_requests - used - 1);
        }

        for (_, key, limit) in tiers {
            buckets
                .entry(key)
                .or_insert_with(|| Bucket { admissions: VecDeque::new(), window: limit.window })
                .admissions
                .push_back(now);
        }
        Admission::Admit { remaining }
    }

    pub fn usage(&self, user: &str, class: &str, now: Instant) -> RateLimitUsage {
        let limit = self.policy.limit_for(class);
        let buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = BucketKey::Command { user: user.to_owned(), class: class.to_owned() };

        let (used, resets_in) = match buckets.get(&key) {
            Some(bucket) => {
                let live: Vec<_> = bucket
                    .admissions
                    .iter()
                    .filter(|at| now.saturating_duration_since(**at) < bucket.window)
                    .collect();
                let resets_in = live
                    .first()
                    .map(|oldest| (**oldest + bucket.window).saturating_duration_since(now))
                    .unwrap_or_default();
                (live.len() as u32, resets_in)
            }
            None => (0, Duration::ZERO),
        };

        RateLimitUsage {
            used,
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(used),
            window: limit.window,
            resets_in,
        }
    }

    /// Drops buckets whose every admission has left the window. Returns how
    /// many were reclaimed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.evict_expired(now);
            !bucket.admissions.is_empty()
        });
        let reclaimed = before - buckets.len();
        if reclaimed > 0 {
            info!(
                event_name = "core.rate_limit.buckets_reclaimed",
                reclaimed,
                remaining = buckets.len(),
                "reclaimed idle rate limit buckets"
            );
        }
        reclaimed
    }

    pub fn bucket_count(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
