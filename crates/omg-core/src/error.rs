//! Error taxonomy (spec §7). Every fallible operation returns a
//! thiserror-derived enum; pipelines never propagate these to the host,
//! they fold into a `PipelineOutcome`'s `errors: Vec<String>` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("atomic write failed for {path}: {source}")]
    AtomicWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("path validation failed: {0}")]
    InvalidPath(String),
    #[error("node validation failed: {0}")]
    Validation(#[from] NodeError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Errors the LLM gateway classifies a `generate` failure into (spec §4.3).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited calling model `{model}`: {cause}")]
    RateLimit { model: String, cause: String },
    #[error("gateway unreachable calling model `{model}`: {cause}")]
    Unreachable { model: String, cause: String },
    #[error("pipeline aborted calling model `{model}`: {cause}")]
    Aborted { model: String, cause: String },
    #[error("calling model `{model}` failed: {cause}")]
    Other { model: String, cause: String },
    #[error("invalid gateway response from model `{model}`: {reason}")]
    Validation { model: String, reason: String },
}

impl GatewayError {
    pub fn model(&self) -> &str {
        match self {
            GatewayError::RateLimit { model, .. }
            | GatewayError::Unreachable { model, .. }
            | GatewayError::Aborted { model, .. }
            | GatewayError::Other { model, .. }
            | GatewayError::Validation { model, .. } => model,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-local; folded into `ReflectionOutcome.errors` rather than
/// propagated, per §7's "pipelines never throw to the host" policy.
#[derive(Debug, Error)]
pub enum ReflectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("oracle response for cluster did not parse as a <reflection> document")]
    ParseFailure,
}

/// Pipeline-local; folded into the dedup outcomes rather than propagated.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("oracle response did not validate: {0}")]
    InvalidResponse(String),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}
