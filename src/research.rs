//! `ResearchSource`: an outbound capability for optional web research
//! ahead of outline generation. A real implementation (SERP/Tavily/Metaphor)
//! is a non-goal; [`NullResearchSource`] is the in-tree test double.

use async_trait::async_trait;
use std::time::Duration;

/// One search result.
#[derive(Debug, Clone)]
pub struct ResearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Outbound web-research capability. Failure is non-fatal to the caller:
/// the orchestrator logs a `warning` and proceeds with empty research.
#[async_trait]
pub trait ResearchSource: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        deadline: Duration,
    ) -> Result<Vec<ResearchResult>, String>;
}

/// Always returns an empty result set; used where no real research
/// backend is configured.
pub struct NullResearchSource;

#[async_trait]
impl ResearchSource for NullResearchSource {
    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
        _deadline: Duration,
    ) -> Result<Vec<ResearchResult>, String> {
        Ok(Vec::new())
    }
}
