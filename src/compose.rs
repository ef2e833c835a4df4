//! Prompt Composer: stage templates and typed response parsing.
//!
//! Stateless: [`StageKind::build_call`] renders a [`LlmCall`] for a named
//! stage, reusing the existing prompt-template/output-strategy machinery.
//! [`parse`] validates a stage's structured output against its expected
//! shape and reports a [`CoreError::SchemaMismatch`] rather than retrying —
//! retry policy belongs to the orchestrator, not the composer.

use crate::client::LlmConfig;
use crate::error::{CoreError, CoreResult};
use crate::llm_call::LlmCall;
use crate::output_strategy::OutputStrategy;
use serde_json::Value;

/// The recognized prompt-composition stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Outline,
    Intro,
    SectionBody,
    Conclusion,
    Faqs,
    MetaDescription,
    Proofread,
    Humanize,
    BookOutline,
    ChapterTopics,
    TopicBody,
}

impl StageKind {
    /// Stable name used for logging, events, and per-stage model overrides.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Outline => "outline",
            StageKind::Intro => "intro",
            StageKind::SectionBody => "section-body",
            StageKind::Conclusion => "conclusion",
            StageKind::Faqs => "faqs",
            StageKind::MetaDescription => "meta-description",
            StageKind::Proofread => "proofread",
            StageKind::Humanize => "humanize",
            StageKind::BookOutline => "book-outline",
            StageKind::ChapterTopics => "chapter-topics",
            StageKind::TopicBody => "topic-body",
        }
    }

    fn prompt_template(&self) -> &'static str {
        match self {
            StageKind::Outline => concat!(
                "You are planning a written article.\n",
                "Topic: {input}\nKeywords: {keywords}\nTone: {tone}\n",
                "{research}\n",
                "Respond with JSON: {{\"title\": str, \"description\": str, \"tags\": [str], ",
                "\"sections\": [{{\"title\": str, \"subtopics\": [str]}}]}}."
            ),
            StageKind::Intro => "Write an engaging introduction for an article titled {title} about: {input}",
            StageKind::SectionBody => concat!(
                "Write the body prose for the subtopic \"{input}\" within the section \"{section_title}\" ",
                "of an article about {article_title}. Tone: {tone}. {research}"
            ),
            StageKind::Conclusion => "Write a conclusion for an article titled {title} covering: {input}",
            StageKind::Faqs => concat!(
                "Generate frequently asked questions and answers for an article about {input}. ",
                "Respond with JSON: [{{\"question\": str, \"answer\": str}}]."
            ),
            StageKind::MetaDescription => "Write a one-sentence SEO meta description (<= 160 chars) for: {input}",
            StageKind::Proofread => "Proofread and lightly copy-edit the following text, preserving its meaning:\n\n{input}",
            StageKind::Humanize => concat!(
                "Rewrite the following text so it reads naturally and conversationally, ",
                "without changing its factual content:\n\n{input}"
            ),
            StageKind::BookOutline => concat!(
                "You are planning a book.\nTitle subject: {input}\nChapter count: {chapter_count}\n",
                "Respond with JSON: {{\"title\": str, \"chapters\": [{{\"title\": str}}]}}."
            ),
            StageKind::ChapterTopics => concat!(
                "List {topics_per_chapter} topic titles to cover in the chapter \"{input}\" ",
                "of a book about {book_title}. Respond with JSON: {{\"topics\": [str]}}."
            ),
            StageKind::TopicBody => concat!(
                "Write the body prose for the topic \"{input}\" within chapter \"{chapter_title}\" ",
                "of a book about {book_title}. Tone: {tone}."
            ),
        }
    }

    fn output_strategy(&self) -> OutputStrategy {
        match self {
            StageKind::Outline
            | StageKind::Faqs
            | StageKind::BookOutline
            | StageKind::ChapterTopics => OutputStrategy::Json,
            StageKind::MetaDescription => OutputStrategy::Text,
            _ => OutputStrategy::Text,
        }
    }

    /// Whether this stage's output is expected to be structured JSON
    /// (as opposed to free prose).
    pub fn is_structured(&self) -> bool {
        matches!(self.output_strategy(), OutputStrategy::Json)
    }

    /// Render an [`LlmCall`] for this stage against the given model.
    ///
    /// Template variables (`{section_title}`, `{tone}`, etc.) are filled in
    /// by the caller via [`ExecCtx`](crate::exec_ctx::ExecCtx)'s `vars` map;
    /// `{input}` is filled in at invocation time from the payload input.
    pub fn build_call(&self, model: impl Into<String>) -> LlmCall {
        self.build_call_with_temperature_offset(model, 0.0)
    }

    /// Render an [`LlmCall`] for this stage with its temperature raised by
    /// `offset` relative to [`LlmConfig::default`]'s baseline.
    ///
    /// Used by the orchestrator's single outline/book-outline retry, which
    /// §4.3 and §7 require to run "with temperature raised by 0.1" rather
    /// than resampling at the same temperature.
    pub fn build_call_with_temperature_offset(&self, model: impl Into<String>, offset: f64) -> LlmCall {
        let config = LlmConfig::default().with_temperature((LlmConfig::default().temperature + offset).min(2.0));
        LlmCall::new(self.name(), self.prompt_template())
            .with_model(model)
            .with_output_strategy(self.output_strategy())
            .with_config(config)
    }
}

/// Validate a stage's parsed JSON output against its expected shape,
/// deserializing into `T`. Reports [`CoreError::SchemaMismatch`] on failure.
pub fn parse<T: serde::de::DeserializeOwned>(stage: StageKind, value: &Value) -> CoreResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| CoreError::SchemaMismatch {
        stage: stage.name().to_string(),
        reason: e.to_string(),
    })
}
