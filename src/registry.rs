//! Job Registry: tracks in-flight generations, supports cancellation,
//! progress inspection, and idempotency.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Which artifact a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Article,
    Book,
}

/// Tone requested for generated prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Professional,
    Conversational,
    Informative,
    Friendly,
    Authoritative,
    Technical,
}

/// Caller-supplied request parameters for one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    /// Article topic, or book title when `kind == Book`. 1-200 chars.
    pub topic: String,
    /// 0-20 entries, each 1-50 chars.
    pub keywords: Vec<String>,
    pub tone: Tone,
    pub research: bool,
    pub proofread: bool,
    pub humanize: bool,
    /// Book only: 1-50, default 5.
    pub chapter_count: u32,
    /// Book only: 1-20, default 3.
    pub topics_per_chapter: u32,
    /// Deduplicates concurrent/retried submissions from the same subject.
    pub idempotency_key: Option<String>,
}

impl JobSpec {
    pub fn validate(&self) -> CoreResult<()> {
        const TOPIC_LIMIT: usize = 200;
        if self.topic.is_empty() || self.topic.chars().count() > TOPIC_LIMIT {
            return Err(CoreError::BadRequest(format!(
                "topic/title must be 1-{} chars",
                TOPIC_LIMIT
            )));
        }
        if self.keywords.len() > 20 {
            return Err(CoreError::BadRequest("at most 20 keywords".into()));
        }
        for k in &self.keywords {
            if k.is_empty() || k.chars().count() > 50 {
                return Err(CoreError::BadRequest("each keyword must be 1-50 chars".into()));
            }
        }
        if self.kind == JobKind::Book {
            if !(1..=50).contains(&self.chapter_count) {
                return Err(CoreError::BadRequest("chapter_count must be 1-50".into()));
            }
            if !(1..=20).contains(&self.topics_per_chapter) {
                return Err(CoreError::BadRequest("topics_per_chapter must be 1-20".into()));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }
}

/// A tracked generation job.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub subject: String,
    pub spec: Arc<JobSpec>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    cancel_flag: Arc<AtomicBool>,
}

impl Job {
    /// Whether cancellation has been requested for this job.
    pub fn is_canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// A cloneable handle the orchestrator polls at suspension points.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }
}

struct Entry {
    job: Job,
}

/// Process-scoped map from job identifier to job state.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job. If `spec.idempotency_key` matches a non-terminal job
    /// already owned by `subject`, that job is returned instead of a new one.
    pub async fn create(&self, subject: impl Into<String>, spec: JobSpec) -> CoreResult<Job> {
        spec.validate()?;
        let subject = subject.into();
        let mut jobs = self.jobs.write().await;

        if let Some(key) = spec.idempotency_key.as_deref() {
            if let Some(existing) = jobs.values().find(|e| {
                e.job.subject == subject
                    && !e.job.state.is_terminal()
                    && e.job.spec.idempotency_key.as_deref() == Some(key)
            }) {
                return Ok(existing.job.clone());
            }
        }

        let job = Job {
            id: Uuid::new_v4(),
            subject,
            spec: Arc::new(spec),
            state: JobState::Queued,
            created_at: Utc::now(),
            terminal_at: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        };
        jobs.insert(job.id, Entry { job: job.clone() });
        Ok(job)
    }

    /// Mark a queued job as running. Errors if the job is not queued.
    pub async fn start(&self, job_id: Uuid) -> CoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::BadRequest("unknown job id".into()))?;
        if entry.job.state != JobState::Queued {
            return Err(CoreError::BadRequest("job is not queued".into()));
        }
        entry.job.state = JobState::Running;
        Ok(())
    }

    /// Transition a running/queued job to a terminal state.
    pub async fn finish(&self, job_id: Uuid, state: JobState) -> CoreResult<()> {
        debug_assert!(state.is_terminal());
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::BadRequest("unknown job id".into()))?;
        if entry.job.state.is_terminal() {
            return Ok(());
        }
        entry.job.state = state;
        entry.job.terminal_at = Some(Utc::now());
        Ok(())
    }

    /// Request cancellation. Idempotent; no-op on an unknown or already
    /// terminal job.
    pub async fn cancel(&self, job_id: Uuid) {
        if let Some(entry) = self.jobs.read().await.get(&job_id) {
            entry.job.cancel_flag.store(true, Ordering::SeqCst);
        }
    }

    pub async fn get(&self, job_id: Uuid) -> CoreResult<Job> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or_else(|| CoreError::BadRequest("unknown job id".into()))
    }

    pub async fn list(&self, subject: &str) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|e| e.job.subject == subject)
            .map(|e| e.job.clone())
            .collect()
    }

    /// Count of non-terminal jobs owned by `subject`, for admission's
    /// in-flight cap check.
    pub async fn inflight_count(&self, subject: &str) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|e| e.job.subject == subject && !e.job.state.is_terminal())
            .count()
    }
}
