use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::provider::{
    cancellable, FinishReason, LlmError, LlmProvider, ResponseFormat, ThinkOptions, ThinkResponse,
};

/// OpenAI-compatible `/v1/chat/completions` backend.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url,
        }
    }

    async fn send(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ThinkOptions,
    ) -> Result<ThinkResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if options.response_format == ResponseFormat::Json {
            body["response_format"] = json!({ "type": "json_object" });
        }

        debug!("OpenAI request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
        let content = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::ParseError("missing choices[0].message.content".into()))?
            .to_string();

        Ok(ThinkResponse {
            content,
            tokens_in: resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            tokens_out: resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            model: resp["model"].as_str().unwrap_or(&self.model).to_string(),
            finish_reason: FinishReason::from_wire(resp["choices"][0]["finish_reason"].as_str()),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        "openai"
    }
}
