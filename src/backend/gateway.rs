//! Provider Gateway: a [`Backend`] that fails over across several concrete backends.
//!
//! Wraps an ordered list of `(base_url, Arc<dyn Backend>)` pairs built from
//! [`ProviderCredential`]s and presents them as a single [`Backend`], so every
//! existing caller of `Backend::complete`/`complete_streaming` — in particular
//! [`LlmCall`](crate::llm_call::LlmCall) via [`ExecCtx`](crate::exec_ctx::ExecCtx) —
//! keeps working unmodified against a gateway as if it were one more backend.

use super::backoff::{BackoffConfig, JitterStrategy};
use super::{AnthropicBackend, Backend, LlmRequest, LlmResponse, OllamaBackend, OpenAiBackend};
use crate::credential::{ProviderCredential, ProviderKind};
use crate::error::{BackendAttempt, Result};
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

struct GatewayEntry {
    name: &'static str,
    base_url: String,
    backend: Arc<dyn Backend>,
}

/// A [`Backend`] that fans a single logical call out across several
/// concrete backends in credential-preference order, advancing on
/// retriable failure and stopping immediately on a non-retriable one.
pub struct ProviderGateway {
    entries: Vec<GatewayEntry>,
    max_attempts: usize,
}

impl ProviderGateway {
    /// Build a gateway from an ordered list of provider credentials.
    ///
    /// Preference order is the order of `credentials`. `max_attempts` bounds
    /// the total number of backend calls made for one logical request;
    /// defaults to the number of credentials when `None`.
    pub fn from_credentials(
        credentials: &[ProviderCredential],
        max_attempts: Option<usize>,
    ) -> Self {
        let entries = credentials
            .iter()
            .map(|cred| {
                let backend: Arc<dyn Backend> = match cred.kind {
                    ProviderKind::Ollama => Arc::new(OllamaBackend),
                    ProviderKind::OpenAi => {
                        let mut b = OpenAiBackend::new();
                        if let Some(ref secret) = cred.secret {
                            b = b.with_api_key(secret.clone());
                        }
                        Arc::new(b)
                    }
                    ProviderKind::Anthropic => {
                        let mut b = AnthropicBackend::new();
                        if let Some(ref secret) = cred.secret {
                            b = b.with_api_key(secret.clone());
                        }
                        Arc::new(b)
                    }
                };
                GatewayEntry {
                    name: cred.kind.as_str(),
                    base_url: cred.base_url.clone(),
                    backend,
                }
            })
            .collect::<Vec<_>>();

        let max_attempts = max_attempts.unwrap_or(entries.len().max(1));
        Self {
            entries,
            max_attempts,
        }
    }

    /// Number of backends configured.
    pub fn backend_count(&self) -> usize {
        self.entries.len()
    }

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            max_retries: 0, // unused here, failover loop tracks its own attempt count
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::Equal,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }
}

#[async_trait]
impl Backend for ProviderGateway {
    async fn complete(
        &self,
        client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        if self.entries.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "ProviderGateway has no backends configured".into(),
            ));
        }

        let backoff = Self::backoff();
        let mut attempts = Vec::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay_for_attempt(attempt as u32 - 1)).await;
            }
            let entry = &self.entries[attempt % self.entries.len()];

            match entry.backend.complete(client, &entry.base_url, request).await {
                Ok(mut resp) => {
                    if attempt > 0 {
                        tracing::warn!(
                            backend = entry.name,
                            prior_attempts = attempt,
                            "provider call succeeded after failover"
                        );
                    }
                    resp.backend = entry.name.to_string();
                    return Ok(resp);
                }
                Err(PipelineError::HttpError {
                    status,
                    body,
                    retry_after: _,
                }) if status == 401 || status == 403 => {
                    return Err(PipelineError::Auth(format!(
                        "{}: HTTP {}: {}",
                        entry.name, status, body
                    )));
                }
                Err(PipelineError::HttpError { status, body, .. })
                    if !backoff.retryable_statuses.contains(&status) =>
                {
                    return Err(PipelineError::HttpError {
                        status,
                        body,
                        retry_after: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(backend = entry.name, error = %e, "provider call failed, trying next backend");
                    attempts.push(BackendAttempt {
                        backend: entry.name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::AllBackendsFailed(attempts))
    }

    async fn complete_streaming(
        &self,
        client: &Client,
        _base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse> {
        if self.entries.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "ProviderGateway has no backends configured".into(),
            ));
        }

        let backoff = Self::backoff();
        let mut attempts = Vec::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay_for_attempt(attempt as u32 - 1)).await;
            }
            let entry = &self.entries[attempt % self.entries.len()];

            match entry
                .backend
                .complete_streaming(client, &entry.base_url, request, on_token)
                .await
            {
                Ok(mut resp) => {
                    resp.backend = entry.name.to_string();
                    return Ok(resp);
                }
                Err(PipelineError::HttpError {
                    status,
                    body,
                    retry_after: _,
                }) if status == 401 || status == 403 => {
                    return Err(PipelineError::Auth(format!(
                        "{}: HTTP {}: {}",
                        entry.name, status, body
                    )));
                }
                Err(PipelineError::HttpError { status, body, .. })
                    if !backoff.retryable_statuses.contains(&status) =>
                {
                    return Err(PipelineError::HttpError {
                        status,
                        body,
                        retry_after: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(backend = entry.name, error = %e, "provider call failed, trying next backend");
                    attempts.push(BackendAttempt {
                        backend: entry.name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::AllBackendsFailed(attempts))
    }

    fn name(&self) -> &'static str {
        "provider-gateway"
    }
}
