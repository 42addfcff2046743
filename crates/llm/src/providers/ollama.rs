use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::provider::{
    cancellable, FinishReason, LlmError, LlmProvider, ResponseFormat, ThinkOptions, ThinkResponse,
};

pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, url: String, model: String) -> Self {
        Self { client, url, model }
    }

    async fn send(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ThinkOptions,
    ) -> Result<ThinkResponse, LlmError> {
        let url = format!("{}/api/chat", self.url);

        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });
        if options.response_format == ResponseFormat::Json {
            body["format"] = json!("json");
        }

        debug!("Ollama request to {}", url);

        let response = self
            .client
            .post(&url)
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
        let content = resp["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::ParseError("missing message.content".into()))?
            .to_string();

        Ok(ThinkResponse {
            content,
            tokens_in: resp["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            tokens_out: resp["eval_count"].as_u64().unwrap_or(0) as u32,
            model: self.model.clone(),
            finish_reason: FinishReason::from_wire(resp["done_reason"].as_str()),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
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
        "ollama"
    }
}
