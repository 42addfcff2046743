use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::provider::{
    cancellable, FinishReason, LlmError, LlmProvider, ThinkOptions, ThinkResponse,
};

/// Anthropic Messages API backend.
pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }

    async fn send(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ThinkOptions,
    ) -> Result<ThinkResponse, LlmError> {
        let url = "https://api.anthropic.com/v1/messages";

        // Claude API uses a separate system parameter
        let body = json!({
            "model": self.model,
            "system": system_prompt,
            "messages": [{ "role": "user", "content": user_prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        debug!("Claude request to {}", url);

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        let content = resp["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.is_empty())
            .ok_or_else(|| LlmError::ParseError("missing content[].text".into()))?;

        Ok(ThinkResponse {
            content,
            tokens_in: resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            tokens_out: resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            model: resp["model"].as_str().unwrap_or(&self.model).to_string(),
            finish_reason: FinishReason::from_wire(resp["stop_reason"].as_str()),
        })
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn think(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ThinkOptions,
    ) -> Result<ThinkResponse, LlmError> {
        cancellable(
            options.cancel.as_ref(),
            self.send(system_prompt, user_prompt, options),
        )
        .await
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}
