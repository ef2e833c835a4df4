//! Environment-driven configuration.
//!
//! This crate is library-first and ships no on-disk config file; environment
//! variables are the only layer, read once at process start by
//! [`AppConfig::from_env`]. Every numeric default here matches the default
//! named for its parameter elsewhere in this crate's docs.

use crate::credential::{ProviderCredential, ProviderKind};
use std::time::Duration;

/// Concurrency caps for fan-out stages and the global in-flight budget.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_parallel_sections: usize,
    pub max_parallel_chapters: usize,
    pub global_inflight_cap: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_sections: 4,
            max_parallel_chapters: 2,
            global_inflight_cap: 64,
        }
    }
}

/// Burst + sustained token bucket parameters for one endpoint class.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_capacity: u32,
    pub burst_refill: Duration,
    pub sustained_capacity: u32,
    pub sustained_refill: Duration,
    pub max_inflight_per_subject: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 10,
            burst_refill: Duration::from_secs(1),
            sustained_capacity: 60,
            sustained_refill: Duration::from_secs(60),
            max_inflight_per_subject: 3,
        }
    }
}

/// Whole-job deadlines by artifact kind.
#[derive(Debug, Clone)]
pub struct DeadlineConfig {
    pub article: Duration,
    pub book: Duration,
    pub cancel_grace_period: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            article: Duration::from_secs(180),
            book: Duration::from_secs(900),
            cancel_grace_period: Duration::from_secs(2),
        }
    }
}

/// Process-wide configuration loaded once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Provider credentials in preference order, as configured via env.
    pub credentials: Vec<ProviderCredential>,
    pub concurrency: ConcurrencyConfig,
    pub rate_limit: RateLimitConfig,
    pub deadlines: DeadlineConfig,
    /// How long a conversation's events are retained after last activity.
    pub conversation_retention: Duration,
    /// Per-subscriber buffered-event capacity before `ErrLagged`.
    pub subscriber_buffer: usize,
    /// Permissive mode: admission does not require a loaded credential.
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            concurrency: ConcurrencyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            deadlines: DeadlineConfig::default(),
            conversation_retention: Duration::from_secs(24 * 60 * 60),
            subscriber_buffer: 64,
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment, falling back to
    /// typed defaults for anything unset.
    pub fn from_env() -> Self {
        Self::from_resolver(|key| std::env::var(key).ok())
    }

    /// Load configuration from a custom key/value resolver, for tests.
    pub fn from_resolver(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            dev_mode: parse_bool(env("GENFORGE_DEV_MODE")),
            ..Self::default()
        };

        if let Some(base_url) = env("GENFORGE_OLLAMA_BASE_URL") {
            let model = env("GENFORGE_OLLAMA_MODEL").unwrap_or_else(|| "llama3".to_string());
            config
                .credentials
                .push(ProviderCredential::new(ProviderKind::Ollama, base_url, model));
        }
        if let Some(secret) = env("GENFORGE_OPENAI_API_KEY") {
            let base_url = env("GENFORGE_OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            let model = env("GENFORGE_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
            config.credentials.push(
                ProviderCredential::new(ProviderKind::OpenAi, base_url, model).with_secret(secret),
            );
        }
        if let Some(secret) = env("GENFORGE_ANTHROPIC_API_KEY") {
            let base_url = env("GENFORGE_ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string());
            let model =
                env("GENFORGE_ANTHROPIC_MODEL").unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string());
            config.credentials.push(
                ProviderCredential::new(ProviderKind::Anthropic, base_url, model)
                    .with_secret(secret),
            );
        }

        if let Some(v) = env("GENFORGE_MAX_PARALLEL_SECTIONS").and_then(|s| s.parse().ok()) {
            config.concurrency.max_parallel_sections = v;
        }
        if let Some(v) = env("GENFORGE_MAX_PARALLEL_CHAPTERS").and_then(|s| s.parse().ok()) {
            config.concurrency.max_parallel_chapters = v;
        }
        if let Some(v) = env("GENFORGE_GLOBAL_INFLIGHT_CAP").and_then(|s| s.parse().ok()) {
            config.concurrency.global_inflight_cap = v;
        }

        if let Some(v) = env("GENFORGE_RATE_BURST_CAPACITY").and_then(|s| s.parse().ok()) {
            config.rate_limit.burst_capacity = v;
        }
        if let Some(v) = env("GENFORGE_RATE_SUSTAINED_CAPACITY").and_then(|s| s.parse().ok()) {
            config.rate_limit.sustained_capacity = v;
        }
        if let Some(v) = env("GENFORGE_MAX_INFLIGHT_PER_SUBJECT").and_then(|s| s.parse().ok()) {
            config.rate_limit.max_inflight_per_subject = v;
        }

        if let Some(v) = env("GENFORGE_ARTICLE_DEADLINE_SECS").and_then(|s| s.parse().ok()) {
            config.deadlines.article = Duration::from_secs(v);
        }
        if let Some(v) = env("GENFORGE_BOOK_DEADLINE_SECS").and_then(|s| s.parse().ok()) {
            config.deadlines.book = Duration::from_secs(v);
        }

        if let Some(v) = env("GENFORGE_CONVERSATION_RETENTION_SECS").and_then(|s| s.parse().ok()) {
            config.conversation_retention = Duration::from_secs(v);
        }
        if let Some(v) = env("GENFORGE_SUBSCRIBER_BUFFER").and_then(|s| s.parse().ok()) {
            config.subscriber_buffer = v;
        }

        config
    }
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_unset() {
        let config = AppConfig::from_resolver(resolver(&[]));
        assert!(config.credentials.is_empty());
        assert!(!config.dev_mode);
        assert_eq!(config.concurrency.max_parallel_sections, 4);
    }

    #[test]
    fn test_reads_openai_credential() {
        let config = AppConfig::from_resolver(resolver(&[("GENFORGE_OPENAI_API_KEY", "sk-test")]));
        assert_eq!(config.credentials.len(), 1);
        assert_eq!(config.credentials[0].kind, ProviderKind::OpenAi);
    }

    #[test]
    fn test_dev_mode_parsing() {
        let config = AppConfig::from_resolver(resolver(&[("GENFORGE_DEV_MODE", "true")]));
        assert!(config.dev_mode);
    }

    #[test]
    fn test_numeric_override() {
        let config =
            AppConfig::from_resolver(resolver(&[("GENFORGE_MAX_PARALLEL_SECTIONS", "8")]));
        assert_eq!(config.concurrency.max_parallel_sections, 8);
    }
}
