//! Pipeline Orchestrator: drives the article and book stage graphs,
//! fanning out section/topic generation with bounded concurrency and
//! gathering results back into outline order.

pub mod article;
pub mod book;

use crate::backend::Backend;
use crate::compose::StageKind;
use crate::config::{ConcurrencyConfig, DeadlineConfig};
use crate::conversation::{ConversationLog, EventKind, Role};
use crate::credential::ProviderCredential;
use crate::error::{CoreError, CoreResult};
use crate::exec_ctx::ExecCtx;
use crate::payload::{Payload, PayloadOutput};
use crate::registry::{Job, JobKind};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a single provider call needs, reused across every stage
/// invocation for one job.
struct CallBase {
    client: Client,
    base_url: String,
    backend: Arc<dyn Backend>,
    cancel_flag: Arc<AtomicBool>,
    credential: ProviderCredential,
}

impl CallBase {
    fn exec_ctx(&self) -> ExecCtx {
        ExecCtx::builder(&self.base_url)
            .client(self.client.clone())
            .backend(self.backend.clone())
            .cancellation(Some(self.cancel_flag.clone()))
            .build()
    }
}

/// Drives the article/book stage graphs against a configured provider
/// backend, a conversation log for progress events, and the shared
/// concurrency/deadline tunables.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    credential: ProviderCredential,
    client: Client,
    pub concurrency: ConcurrencyConfig,
    pub deadlines: DeadlineConfig,
    pub conversation_log: Arc<ConversationLog>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        credential: ProviderCredential,
        concurrency: ConcurrencyConfig,
        deadlines: DeadlineConfig,
        conversation_log: Arc<ConversationLog>,
    ) -> Self {
        Self {
            backend,
            credential,
            client: Client::new(),
            concurrency,
            deadlines,
            conversation_log,
        }
    }

    fn call_base(&self, job: &Job) -> CallBase {
        CallBase {
            client: self.client.clone(),
            base_url: self.credential.base_url.clone(),
            backend: self.backend.clone(),
            cancel_flag: job.cancellation_flag(),
            credential: self.credential.clone(),
        }
    }

    async fn emit(&self, conv: Uuid, kind: EventKind, payload: Value) {
        self.conversation_log.append(conv, kind, Role::System, payload).await;
    }

    /// Run one stage call, enforcing `remaining` as the call's deadline and
    /// observing cancellation before and after the call. On success, appends
    /// a `provider_call` event recording the backend used and token counts.
    #[allow(clippy::too_many_arguments)]
    async fn call_stage(
        &self,
        base: &CallBase,
        job: &Job,
        conv: Uuid,
        stage: StageKind,
        vars: Vec<(&str, String)>,
        input: Value,
        remaining: Duration,
    ) -> CoreResult<PayloadOutput> {
        self.call_stage_with_temperature_offset(base, job, conv, stage, vars, input, remaining, 0.0).await
    }

    /// Same as [`Self::call_stage`], but builds the call with its temperature
    /// raised by `temperature_offset`. Used for the single outline/book-outline
    /// retry on parse failure (§4.3, §7: "retried once with temperature raised
    /// by 0.1").
    #[allow(clippy::too_many_arguments)]
    async fn call_stage_with_temperature_offset(
        &self,
        base: &CallBase,
        job: &Job,
        conv: Uuid,
        stage: StageKind,
        vars: Vec<(&str, String)>,
        input: Value,
        remaining: Duration,
        temperature_offset: f64,
    ) -> CoreResult<PayloadOutput> {
        if job.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let model = base.credential.model_for(stage.name()).to_string();
        let mut ctx = base.exec_ctx();
        for (key, value) in vars {
            ctx.vars.insert(key.to_string(), value);
        }
        let call = stage.build_call_with_temperature_offset(model, temperature_offset);

        let result = tokio::time::timeout(remaining, call.invoke(&ctx, input)).await;
        match result {
            Err(_) => Err(CoreError::Timeout),
            Ok(Err(pipeline_err)) => Err(CoreError::from(pipeline_err)),
            Ok(Ok(output)) => {
                if job.is_canceled() {
                    return Err(CoreError::Canceled);
                }
                if let Some(tokens) = output.tokens {
                    self.emit(
                        conv,
                        EventKind::ProviderCall,
                        json!({
                            "stage": stage.name(),
                            "backend": output.backend.as_deref().unwrap_or("unknown"),
                            "input_tokens": tokens.input,
                            "output_tokens": tokens.output,
                            "tokens_approximate": tokens.approximate,
                        }),
                    )
                    .await;
                }
                Ok(output)
            }
        }
    }

    /// Post-process one piece of prose: proofread (if enabled), then
    /// humanize (if enabled). Soft failures leave the body unchanged.
    #[allow(clippy::too_many_arguments)]
    async fn post_process(
        &self,
        base: &CallBase,
        job: &Job,
        conv: Uuid,
        mut body: String,
        proofread: bool,
        humanize: bool,
        remaining: Duration,
    ) -> String {
        if proofread {
            let outcome = self
                .call_stage(base, job, conv, StageKind::Proofread, vec![], json!(body.clone()), remaining)
                .await;
            match outcome {
                Ok(output) => body = as_text(&output.value, &body),
                Err(e) => {
                    self.emit(conv, EventKind::Warning, json!({"stage": "proofread", "error": e.to_string()}))
                        .await;
                }
            }
        }
        if humanize {
            let outcome = self
                .call_stage(base, job, conv, StageKind::Humanize, vec![], json!(body.clone()), remaining)
                .await;
            match outcome {
                Ok(output) => body = as_text(&output.value, &body),
                Err(e) => {
                    self.emit(conv, EventKind::Warning, json!({"stage": "humanize", "error": e.to_string()}))
                        .await;
                }
            }
        }
        body
    }
}

fn as_text(value: &Value, fallback: &str) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => fallback.to_string(),
        other => other.to_string(),
    }
}

/// Whole-job deadline for the given kind.
pub(crate) fn deadline_for(deadlines: &DeadlineConfig, kind: JobKind) -> Duration {
    match kind {
        JobKind::Article => deadlines.article,
        JobKind::Book => deadlines.book,
    }
}

/// Tone as rendered into a prompt template.
pub(crate) fn tone_str(tone: crate::registry::Tone) -> &'static str {
    use crate::registry::Tone::*;
    match tone {
        Professional => "professional",
        Conversational => "conversational",
        Informative => "informative",
        Friendly => "friendly",
        Authoritative => "authoritative",
        Technical => "technical",
    }
}
