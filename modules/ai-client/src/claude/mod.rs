mod client;
pub(crate) mod types;

use std::time::Duration;

use crate::error::AiError;

use client::ClaudeClient;
use types::*;

const TOOL_NAME: &str = "structured_response";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    base_url: Option<String>,
    timeout: Duration,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Per-request timeout. Expiry surfaces as [`AiError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client(&self) -> Result<ClaudeClient, AiError> {
        ClaudeClient::new(&self.api_key, self.base_url.as_deref(), self.timeout)
    }

    /// Force a tool call with an explicit schema and return the raw tool input.
    ///
    /// The payload is not deserialized here; callers validate it themselves
    /// and keep the raw response for auditing.
    pub async fn extract_value(
        &self,
        schema: serde_json::Value,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<serde_json::Value, AiError> {
        let request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .temperature(0.0)
            .forced_tool(ToolDefinitionWire {
                name: TOOL_NAME.to_string(),
                description: "Return the structured response for this request.".to_string(),
                input_schema: schema,
            });

        let response = self.client()?.chat(&request).await?;

        if let Some(input) = response.tool_input(TOOL_NAME) {
            return Ok(input.clone());
        }
        match response.text() {
            Some(text) => Err(AiError::Parse(format!("model answered without the tool: {text}"))),
            None => Err(AiError::MissingOutput),
        }
    }
}
