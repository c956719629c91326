//! Reconciler knobs, read from `KAPPLY_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a patch would change a field the control plane treats as
/// immutable after creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImmutablePolicy {
    /// Submit the patch and report whatever the remote answers.
    #[default]
    PassThrough,
    /// Fail the identity before writing when a registered immutable field would change.
    RejectEarly,
}

impl ImmutablePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass-through" | "passthrough" => Some(Self::PassThrough),
            "reject" | "reject-early" => Some(Self::RejectEarly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Identities processed at once.
    pub concurrency: usize,
    /// Fetch/write cycles per identity before giving up.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub immutable_policy: ImmutablePolicy,
    /// Delete orphans after the apply phase.
    pub gc: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 4,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            immutable_policy: ImmutablePolicy::PassThrough,
            gc: true,
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            concurrency: env_parse::<usize>("KAPPLY_CONCURRENCY").filter(|n| *n > 0).unwrap_or(d.concurrency),
            max_attempts: env_parse::<u32>("KAPPLY_MAX_ATTEMPTS").filter(|n| *n > 0).unwrap_or(d.max_attempts),
            backoff_base: env_parse::<u64>("KAPPLY_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_parse::<u64>("KAPPLY_BACKOFF_MAX_MS").map(Duration::from_millis).unwrap_or(d.backoff_max),
            immutable_policy: std::env::var("KAPPLY_IMMUTABLE_POLICY")
                .ok()
                .and_then(|s| ImmutablePolicy::parse(&s))
                .unwrap_or(d.immutable_policy),
            gc: !env_flag("KAPPLY_SKIP_GC"),
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential from
    /// `backoff_base`, capped at `backoff_max`, plus up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.backoff_base.saturating_mul(1u32 << shift).min(self.backoff_max);
        let half = exp.as_millis() as u64 / 2;
        let jitter = if half == 0 { 0 } else { rand::thread_rng().gen_range(0..=half) };
        exp + Duration::from_millis(jitter)
    }
}
