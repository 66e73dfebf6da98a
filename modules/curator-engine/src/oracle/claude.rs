use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use ai_client::{Claude, StructuredOutput};
use curator_common::OracleConfig;

use super::contract::{AtomicityWire, DecisionWire, SynthesisWire};
use super::prompts;
use super::{AtomicityRequest, DecisionRequest, MergeRequest};
use crate::traits::DecisionOracle;

/// Anthropic-backed oracle. Every call forces a tool use whose input schema
/// is generated from the response wire type; the tool input is handed back
/// as JSON text for contract validation.
pub struct ClaudeOracle {
    claude: Claude,
    name: String,
}

impl ClaudeOracle {
    pub fn new(api_key: &str, config: &OracleConfig) -> Self {
        let mut claude = Claude::new(api_key, &config.model)
            .with_timeout(Duration::from_secs(config.timeout_secs));
        if let Some(url) = &config.base_url {
            claude = claude.with_base_url(url);
        }
        Self {
            name: format!("claude:{}", config.model),
            claude,
        }
    }

    async fn call<T: StructuredOutput>(&self, system: &str, user: String) -> Result<String> {
        let value = self
            .claude
            .extract_value(T::tool_schema(), system, user)
            .await?;
        debug!(schema = %T::type_name(), "Oracle response received");
        Ok(serde_json::to_string(&value)?)
    }
}

#[async_trait]
impl DecisionOracle for ClaudeOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<String> {
        self.call::<DecisionWire>(prompts::DECISION_SYSTEM, prompts::decision_prompt(request))
            .await
    }

    async fn check_atomicity(&self, request: &AtomicityRequest) -> Result<String> {
        self.call::<AtomicityWire>(prompts::ATOMICITY_SYSTEM, prompts::atomicity_prompt(request))
            .await
    }

    async fn synthesize(&self, request: &MergeRequest) -> Result<String> {
        self.call::<SynthesisWire>(prompts::SYNTHESIS_SYSTEM, prompts::synthesis_prompt(request))
            .await
    }
}
