//! Rate Limiter & Admission: per-subject, per-endpoint-class token buckets
//! plus credential/in-flight gating.

use crate::config::RateLimitConfig;
use crate::error::{CoreError, CoreResult};
use crate::registry::JobRegistry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// The endpoint class a request is admitted against. Burst/sustained
/// buckets are tracked independently per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    SubmitJob,
    ReadJob,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_period: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: capacity as f64 / refill_period.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds until at least one token is available.
    fn seconds_until_token(&self) -> f64 {
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_per_sec
        }
    }
}

struct BucketPair {
    burst: TokenBucket,
    sustained: TokenBucket,
}

/// Per-subject, per-endpoint-class admission gate.
pub struct Admission {
    buckets: Mutex<HashMap<(String, EndpointClass), BucketPair>>,
    config: RateLimitConfig,
}

impl Admission {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Attempt to admit a request. On success both buckets are decremented
    /// by one token atomically; on rejection nothing is decremented.
    async fn check_rate_limit(&self, subject: &str, class: EndpointClass) -> CoreResult<()> {
        let mut buckets = self.buckets.lock().await;
        let pair = buckets
            .entry((subject.to_string(), class))
            .or_insert_with(|| BucketPair {
                burst: TokenBucket::new(self.config.burst_capacity, self.config.burst_refill),
                sustained: TokenBucket::new(
                    self.config.sustained_capacity,
                    self.config.sustained_refill,
                ),
            });

        let now = Instant::now();
        pair.burst.refill(now);
        pair.sustained.refill(now);

        if pair.burst.tokens >= 1.0 && pair.sustained.tokens >= 1.0 {
            pair.burst.tokens -= 1.0;
            pair.sustained.tokens -= 1.0;
            return Ok(());
        }

        let wait = pair.burst.seconds_until_token().max(pair.sustained.seconds_until_token());
        let retry_after = Duration::from_secs_f64(wait.max(1.0).ceil());
        Err(CoreError::RateLimited { retry_after })
    }

    /// Full admission check: rate limit, credential/dev-mode gating, and
    /// per-subject in-flight job cap, in that order.
    pub async fn admit(
        &self,
        subject: &str,
        class: EndpointClass,
        has_credential: bool,
        dev_mode: bool,
        registry: &JobRegistry,
    ) -> CoreResult<()> {
        self.check_rate_limit(subject, class).await?;

        if !has_credential && !dev_mode {
            return Err(CoreError::Auth("no provider credential loaded".into()));
        }

        if registry.inflight_count(subject).await >= self.config.max_inflight_per_subject {
            return Err(CoreError::TooManyInflight);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{JobKind, JobSpec, Tone};

    fn spec() -> JobSpec {
        JobSpec {
            kind: JobKind::Article,
            topic: "t".into(),
            keywords: vec![],
            tone: Tone::Informative,
            research: false,
            proofread: false,
            humanize: false,
            chapter_count: 5,
            topics_per_chapter: 3,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_admits_within_burst_capacity() {
        let config = RateLimitConfig {
            burst_capacity: 3,
            ..RateLimitConfig::default()
        };
        let admission = Admission::new(config);
        let registry = JobRegistry::new();
        for _ in 0..3 {
            admission
                .admit("alice", EndpointClass::SubmitJob, true, false, &registry)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejects_past_burst_capacity_with_retry_after() {
        let config = RateLimitConfig {
            burst_capacity: 2,
            sustained_capacity: 100,
            ..RateLimitConfig::default()
        };
        let admission = Admission::new(config);
        let registry = JobRegistry::new();
        for _ in 0..2 {
            admission
                .admit("alice", EndpointClass::SubmitJob, true, false, &registry)
                .await
                .unwrap();
        }
        let err = admission
            .admit("alice", EndpointClass::SubmitJob, true, false, &registry)
            .await
            .unwrap_err();
        match err {
            CoreError::RateLimited { retry_after } => {
                assert!(retry_after.as_secs() >= 1);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denies_without_credential_unless_dev_mode() {
        let admission = Admission::new(RateLimitConfig::default());
        let registry = JobRegistry::new();
        let err = admission
            .admit("alice", EndpointClass::SubmitJob, false, false, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));

        admission
            .admit("bob", EndpointClass::SubmitJob, false, true, &registry)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_denies_when_inflight_cap_exceeded() {
        let config = RateLimitConfig {
            max_inflight_per_subject: 1,
            ..RateLimitConfig::default()
        };
        let admission = Admission::new(config);
        let registry = JobRegistry::new();
        registry.create("alice", spec()).await.unwrap();
        let err = admission
            .admit("alice", EndpointClass::SubmitJob, true, false, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TooManyInflight));
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let config = RateLimitConfig {
            burst_capacity: 1,
            ..RateLimitConfig::default()
        };
        let admission = Admission::new(config);
        let registry = JobRegistry::new();
        admission
            .admit("alice", EndpointClass::SubmitJob, true, false, &registry)
            .await
            .unwrap();
        admission
            .admit("bob", EndpointClass::SubmitJob, true, false, &registry)
            .await
            .unwrap();
    }
}
