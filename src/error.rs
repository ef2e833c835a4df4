use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A pipeline stage failed with a descriptive message.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// The pipeline or payload was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// No credential is configured for the requested backend.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Every backend configured on a [`ProviderGateway`](crate::backend::ProviderGateway)
    /// failed for a single logical call.
    #[error("all backends failed: {}", summarize_attempts(.0))]
    AllBackendsFailed(Vec<BackendAttempt>),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

fn summarize_attempts(attempts: &[BackendAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.backend, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One backend's outcome within a failed [`ProviderGateway`](crate::backend::ProviderGateway) call.
#[derive(Debug, Clone)]
pub struct BackendAttempt {
    /// Name of the backend that was tried ([`Backend::name`](crate::backend::Backend::name)).
    pub backend: String,
    /// Stringified error the backend produced.
    pub error: String,
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Surfaced error kinds for the generation pipeline core.
///
/// Distinct from [`PipelineError`]: `PipelineError` is the transport/backend
/// layer's error type and includes kinds (like a single HTTP 503) that are
/// handled internally by retry/failover and never reach a caller.
/// `CoreError` is what a job, admission check, or orchestration stage
/// actually returns to its caller.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Request failed local validation (field length, enum value, etc.).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No credential loaded for the requested backend and dev-mode is off.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Subject exceeded its rate-limit allowance.
    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after: Duration,
    },

    /// Subject has too many concurrent jobs in flight.
    #[error("too many in-flight jobs for this subject")]
    TooManyInflight,

    /// Every configured backend failed for a provider call; job cannot proceed.
    #[error("all backends failed: {}", summarize_attempts(.0))]
    AllBackendsFailed(Vec<BackendAttempt>),

    /// A structured response did not conform to its expected schema after
    /// all repair/retry attempts.
    #[error("stage '{stage}' produced a response that didn't match its schema: {reason}")]
    SchemaMismatch {
        /// The stage whose output failed to parse.
        stage: String,
        /// Human-readable parse failure reason.
        reason: String,
    },

    /// Too many fan-out items failed; the success floor was not met.
    #[error("degraded: only {succeeded}/{total} items succeeded")]
    Degraded {
        /// Number of fan-out items that succeeded.
        succeeded: usize,
        /// Total fan-out items attempted.
        total: usize,
    },

    /// The job's deadline elapsed before completion.
    #[error("job timed out")]
    Timeout,

    /// The job was cancelled by its caller.
    #[error("job was canceled")]
    Canceled,

    /// An uncategorized internal failure. The caller sees only the
    /// correlation id; details are logged at the capture site.
    #[error("internal error (correlation id {correlation_id})")]
    Internal {
        /// Id to correlate this error with the `tracing::error!` log line
        /// that captured the underlying cause.
        correlation_id: uuid::Uuid,
    },
}

impl CoreError {
    /// Wrap an arbitrary error as [`CoreError::Internal`], logging the cause
    /// under a fresh correlation id.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4();
        tracing::error!(%correlation_id, %cause, "internal error");
        CoreError::Internal { correlation_id }
    }
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => CoreError::Canceled,
            PipelineError::Auth(msg) => CoreError::Auth(msg),
            PipelineError::AllBackendsFailed(attempts) => CoreError::AllBackendsFailed(attempts),
            PipelineError::HttpError { status, body, .. } if (400..500).contains(&status) => {
                CoreError::BadRequest(format!("HTTP {}: {}", status, body))
            }
            other => CoreError::internal(other),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
