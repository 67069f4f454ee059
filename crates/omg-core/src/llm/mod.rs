//! The LLM Gateway: a validated wrapper around a caller-provided oracle
//! (spec §4.3). The host injects the `Generator` implementation; this
//! module never calls out to a model directly.

#[cfg(feature = "https-fallback")]
pub mod https_fallback;

use async_trait::async_trait;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub usage: Usage,
}

/// The pure oracle contract: `generate(system, user, maxTokens) ->
/// {content, usage}`. Implemented by the host application.
#[async_trait]
pub trait Generator: Send + Sync {
    /// The model name, used to annotate errors.
    fn model_name(&self) -> &str;

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResponse, String>;
}

/// Wraps a `Generator`, validating inputs/outputs and classifying failures
/// into the typed errors pipelines branch on.
pub struct Gateway<G: Generator> {
    generator: G,
}

impl<G: Generator> Gateway<G> {
    pub fn new(generator: G) -> Self {
        Gateway { generator }
    }

    pub async fn generate(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
        max_tokens: u32,
    ) -> Result<GenerateResponse, GatewayError> {
        let model = self.generator.model_name().to_string();

        if max_tokens == 0 {
            return Err(GatewayError::Validation {
                model,
                reason: "maxTokens must be a positive integer".to_string(),
            });
        }

        let params = GenerateParams {
            system: system.into(),
            user: user.into(),
            max_tokens,
        };

        // usage.inputTokens/outputTokens >= 0 is a type-level invariant here
        // (both are u64), so no separate runtime validation is needed.
        self.generator
            .generate(params)
            .await
            .map_err(|cause| classify_error(&model, &cause))
    }
}

/// Classification order (spec §4.3): rate-limit, then unreachable, else
/// other. Matching is substring-based over the raw error message.
fn classify_error(model: &str, message: &str) -> GatewayError {
    let lower = message.to_lowercase();

    const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
    const UNREACHABLE_MARKERS: &[&str] = &[
        "econnrefused",
        "econnreset",
        "etimedout",
        "enotfound",
        "fetch failed",
        "connection error",
    ];

    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::RateLimit {
            model: model.to_string(),
            cause: message.to_string(),
        };
    }

    if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::Unreachable {
            model: model.to_string(),
            cause: message.to_string(),
        };
    }

    GatewayError::Other {
        model: model.to_string(),
        cause: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeGenerator {
        model: String,
        result: Result<GenerateResponse, String>,
    }

    #[async_trait]
    impl Generator for FakeGenerator {
        fn model_name(&self) -> &str {
            &self.model
        }

        async fn generate(&self, _params: GenerateParams) -> Result<GenerateResponse, String> {
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn rejects_zero_max_tokens() {
        let gw = Gateway::new(FakeGenerator {
            model: "test-model".into(),
            result: Ok(GenerateResponse {
                content: "ok".into(),
                usage: Usage::default(),
            }),
        });

        let err = gw.generate("sys", "user", 0).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[tokio::test]
    async fn classifies_rate_limit_errors() {
        let gw = Gateway::new(FakeGenerator {
            model: "test-model".into(),
            result: Err("HTTP 429 Too Many Requests".into()),
        });

        let err = gw.generate("sys", "user", 100).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimit { .. }));
        assert_eq!(err.model(), "test-model");
    }

    #[tokio::test]
    async fn classifies_unreachable_errors() {
        let gw = Gateway::new(FakeGenerator {
            model: "test-model".into(),
            result: Err("connect ECONNREFUSED 127.0.0.1:443".into()),
        });

        let err = gw.generate("sys", "user", 100).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn classifies_other_errors() {
        let gw = Gateway::new(FakeGenerator {
            model: "test-model".into(),
            result: Err("something went sideways".into()),
        });

        let err = gw.generate("sys", "user", 100).await.unwrap_err();
        assert!(matches!(err, GatewayError::Other { .. }));
    }

    #[tokio::test]
    async fn returns_content_and_usage_on_success() {
        let gw = Gateway::new(FakeGenerator {
            model: "test-model".into(),
            result: Ok(GenerateResponse {
                content: "<observations></observations>".into(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            }),
        });

        let response = gw.generate("sys", "user", 100).await.unwrap();
        assert_eq!(response.content, "<observations></observations>");
        assert_eq!(response.usage.input_tokens, 10);
    }
}
