//! Optional direct HTTPS fallback calling an OpenAI-compatible Chat
//! Completions endpoint, for hosts that don't want to wire up their own
//! `Generator` (spec §4.3). Feature-gated behind `https-fallback`.

use serde::{Deserialize, Serialize};

use super::{GenerateParams, GenerateResponse, Generator, Usage};

#[derive(Debug, Clone)]
pub struct HttpsFallbackConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

pub struct HttpsFallbackGenerator {
    config: HttpsFallbackConfig,
    client: reqwest::Client,
}

impl HttpsFallbackGenerator {
    pub fn new(config: HttpsFallbackConfig) -> Self {
        HttpsFallbackGenerator {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
    usage: UsageField,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct UsageField {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait::async_trait]
impl Generator for HttpsFallbackGenerator {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResponse, String> {
        let request = ChatCompletionsRequest {
            model: &self.config.model,
            max_tokens: params.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &params.system,
                },
                ChatMessage {
                    role: "user",
                    content: &params.user,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }

        let parsed: ChatCompletionsResponse = response.json().await.map_err(|e| e.to_string())?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| "empty choices array".to_string())?;

        Ok(GenerateResponse {
            content,
            usage: Usage {
                input_tokens: parsed.usage.prompt_tokens,
                output_tokens: parsed.usage.completion_tokens,
            },
        })
    }
}
