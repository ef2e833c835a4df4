//! # genforge-core
//!
//! The generation pipeline core for long-form article and book generation:
//! provider failover across LLM backends, prompt composition per stage,
//! bounded-concurrency fan-out/fan-in orchestration, a conversation event
//! log, rate limiting/admission, and a job registry.
//!
//! Rendering the finished [`artifact::Article`]/[`artifact::Book`] to
//! Markdown or another document format, and any HTTP/RPC transport around
//! this crate, are left to the embedding application.
//!
//! ## Core Concepts
//!
//! - **[`Payload`]** — object-safe trait for executable units. Takes a
//!   `serde_json::Value` input, returns a [`PayloadOutput`].
//! - **[`ExecCtx`]** — shared execution context (HTTP client, endpoint,
//!   template vars, cancellation, optional event handler).
//! - **[`LlmCall`]** — renders a stage's prompt, calls a [`Backend`], parses
//!   the response.
//! - **[`backend::ProviderGateway`]** — a [`backend::Backend`] that fails
//!   over across several concrete provider backends for a single logical call.
//! - **[`compose::StageKind`]** — the named prompt-composition stages and
//!   their templates/output strategies.
//! - **[`Chain`]** — sequential composition of payloads.
//!
//! ## Quick Start (Payload API)
//!
//! ```no_run
//! use genforge_core::{LlmCall, Chain, ExecCtx};
//! use genforge_core::payload::Payload;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Debug, Deserialize)]
//! struct Analysis { summary: String }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ExecCtx::builder("http://localhost:11434").build();
//!
//!     let chain = Chain::new("analyze")
//!         .push(Box::new(
//!             LlmCall::new("draft", "Analyze: {input}")
//!                 .with_config(genforge_core::LlmConfig::default().with_json_mode(true))
//!         ))
//!         .push(Box::new(
//!             LlmCall::new("refine", "Refine this analysis: {input}")
//!                 .with_config(genforge_core::LlmConfig::default().with_json_mode(true))
//!         ));
//!
//!     let output = chain.execute(&ctx, json!("Your text here")).await?;
//!     let result: Analysis = output.parse_as()?;
//!     println!("{}", result.summary);
//!     Ok(())
//! }
//! ```

// --- New payload layer ---
pub mod backend;
pub mod chain;
pub mod diagnostics;
pub mod events;
pub mod exec_ctx;
pub mod llm_call;
pub mod output_parser;
pub mod output_strategy;
pub mod parsing;
pub mod payload;
pub mod retry;
pub mod streaming;

// --- Generation pipeline core ---
pub mod admission;
pub mod artifact;
pub mod compose;
pub mod config;
pub mod conversation;
pub mod credential;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod research;

// --- Original modules (still public) ---
pub mod client;
pub mod error;
pub mod prompt;

// --- Primary exports: new payload API ---
pub use backend::{BackoffConfig, MockBackend, OllamaBackend};
pub use backend::{AnthropicBackend, OpenAiBackend, ProviderGateway};
pub use chain::Chain;
pub use diagnostics::ParseDiagnostics;
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use llm_call::LlmCall;
pub use output_strategy::OutputStrategy;
pub use payload::{BoxFut, Payload, PayloadOutput};
pub use retry::RetryConfig;
pub use streaming::StreamingDecoder;

// --- Generation pipeline core exports ---
pub use artifact::{Article, Book, Chapter, Section, SubTopic, Topic};
pub use compose::StageKind;
pub use config::AppConfig;
pub use credential::{ProviderCredential, ProviderKind};
pub use error::{CoreError, CoreResult};
pub use registry::{Job, JobKind, JobSpec, JobState};

// --- Re-exports: original API (compatibility) ---
pub use client::LlmConfig;
pub use error::{PipelineError, Result};
