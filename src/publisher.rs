//! `Publisher`: an outbound capability the generation pipeline exposes
//! finished artifacts to. Consumed by out-of-scope glue, not by the
//! orchestrator itself; a real implementation (blog host, repository,
//! document site) is a non-goal.

use crate::artifact::Article;
use async_trait::async_trait;

/// Where and how to publish an artifact; opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct PublishTarget {
    pub destination: String,
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub url: String,
    pub identifier: String,
}

/// Outbound publishing capability.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        article: &Article,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, String>;
}

/// Deterministic stub publisher for tests; never performs network I/O.
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(
        &self,
        article: &Article,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, String> {
        Ok(PublishReceipt {
            url: format!("null://{}/{}", target.destination, article.id),
            identifier: article.id.to_string(),
        })
    }
}
