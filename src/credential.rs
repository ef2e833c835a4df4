//! Provider credentials.
//!
//! [`ProviderCredential`] is process-scoped configuration for one backend
//! family. The [`ProviderGateway`](crate::backend::ProviderGateway)
//! exclusively owns credentials; no other component reads a secret.

use std::collections::HashMap;

/// Which backend family a credential configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Local Ollama server, no authentication.
    Ollama,
    /// Any OpenAI-compatible chat-completions API.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
}

impl ProviderKind {
    /// Stable lowercase name, matching `Backend::name()` of the backend it configures.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Process-scoped configuration for one backend family.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    /// Which backend family this credential is for.
    pub kind: ProviderKind,
    /// Base URL for the provider's API.
    pub base_url: String,
    /// API key / secret, if the backend requires one (Ollama does not).
    pub secret: Option<String>,
    /// Model identifier used unless a stage names an override.
    pub default_model: String,
    /// Per-stage model overrides, keyed by stage name.
    pub model_overrides: HashMap<String, String>,
}

impl ProviderCredential {
    /// Create a credential for the given backend family.
    pub fn new(kind: ProviderKind, base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            secret: None,
            default_model: default_model.into(),
            model_overrides: HashMap::new(),
        }
    }

    /// Attach a secret (API key).
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Add a per-stage model override.
    pub fn with_model_override(mut self, stage: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_overrides.insert(stage.into(), model.into());
        self
    }

    /// Resolve the model to use for a given stage name.
    pub fn model_for(&self, stage: &str) -> &str {
        self.model_overrides
            .get(stage)
            .map(|s| s.as_str())
            .unwrap_or(&self.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_for_falls_back_to_default() {
        let cred = ProviderCredential::new(ProviderKind::OpenAi, "https://api.openai.com", "gpt-4o-mini");
        assert_eq!(cred.model_for("outline"), "gpt-4o-mini");
    }

    #[test]
    fn test_model_for_uses_override() {
        let cred = ProviderCredential::new(ProviderKind::OpenAi, "https://api.openai.com", "gpt-4o-mini")
            .with_model_override("outline", "gpt-4o");
        assert_eq!(cred.model_for("outline"), "gpt-4o");
        assert_eq!(cred.model_for("section-body"), "gpt-4o-mini");
    }

    #[test]
    fn test_kind_as_str_matches_backend_names() {
        assert_eq!(ProviderKind::Ollama.as_str(), "ollama");
        assert_eq!(ProviderKind::OpenAi.as_str(), "openai");
        assert_eq!(ProviderKind::Anthropic.as_str(), "anthropic");
    }
}
