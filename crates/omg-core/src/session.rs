//! Per-session observation/reflection trigger state (spec §4.6). All
//! functions here are pure transitions over `(messages, state, config)`;
//! persistence is a thin JSON load/save around them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::store::validate_path_component;
use crate::token::estimate_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    EveryTurn,
    Threshold,
    Manual,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    pub message_token_threshold: u64,
    pub observation_token_threshold: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            mode: TriggerMode::Threshold,
            message_token_threshold: 2_000,
            observation_token_threshold: 8_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub last_observed_at_ms: i64,
    pub pending_message_tokens: u64,
    pub total_observation_tokens: u64,
    pub last_reflection_total_tokens: u64,
    pub observation_boundary_message_index: usize,
    pub node_count: u64,
    pub last_observation_node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_source_fingerprints: Option<Vec<String>>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            last_observed_at_ms: 0,
            pending_message_tokens: 0,
            total_observation_tokens: 0,
            last_reflection_total_tokens: 0,
            observation_boundary_message_index: 0,
            node_count: 0,
            last_observation_node_ids: Vec::new(),
            recent_source_fingerprints: None,
        }
    }
}

/// Replaces (not adds) `pendingMessageTokens` with the token sum over
/// `messages[boundaryIndex:]`. Idempotent — safe to call every turn.
pub fn accumulate_tokens(messages: &[Message], state: &mut SessionState) {
    state.pending_message_tokens = messages
        .iter()
        .skip(state.observation_boundary_message_index)
        .map(|m| estimate_tokens(&m.content))
        .sum();
}

pub fn should_trigger_observation(state: &SessionState, config: &TriggerConfig) -> bool {
    match config.mode {
        TriggerMode::EveryTurn => true,
        TriggerMode::Threshold => state.pending_message_tokens >= config.message_token_threshold,
        TriggerMode::Manual => false,
    }
}

/// Delta-based: fires once `totalObservationTokens - lastReflectionTotalTokens`
/// crosses the threshold, and stays true until a reflection run advances
/// `lastReflectionTotalTokens`. Never re-fires spuriously on every turn once
/// the delta has crossed.
pub fn should_trigger_reflection(state: &SessionState, config: &ReflectionTriggerConfig) -> bool {
    state
        .total_observation_tokens
        .saturating_sub(state.last_reflection_total_tokens)
        >= config.observation_token_threshold
}

#[derive(Debug, Clone)]
pub struct ReflectionTriggerConfig {
    pub observation_token_threshold: u64,
}

impl Default for ReflectionTriggerConfig {
    fn default() -> Self {
        ReflectionTriggerConfig {
            observation_token_threshold: 8_000,
        }
    }
}

fn state_path(workspace_dir: &Path, session_key: &str) -> Result<PathBuf, SessionError> {
    validate_path_component(session_key)
        .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
    Ok(workspace_dir
        .join(".omg-state")
        .join(format!("{session_key}.json")))
}

pub async fn load_session_state(
    workspace_dir: &Path,
    session_key: &str,
) -> Result<SessionState, SessionError> {
    let path = state_path(workspace_dir, session_key)?;
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionState::default()),
        Err(e) => {
            tracing::warn!("session state load failed for `{session_key}`, starting fresh: {e}");
            Ok(SessionState::default())
        }
    }
}

pub async fn save_session_state(
    workspace_dir: &Path,
    session_key: &str,
    state: &SessionState,
) -> Result<(), SessionError> {
    let path = state_path(workspace_dir, session_key)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let serialized = serde_json::to_string_pretty(state)?;
    crate::store::atomic_write(&path, &serialized).await?;
    Ok(())
}

/// Called before a host context-compaction event: bypasses the usual
/// trigger check and forces an observation pass. Callers supply the
/// observation closure; any error it returns is logged, never propagated,
/// so compaction itself is never blocked by an observation failure.
pub async fn before_compaction<F, Fut>(
    workspace_dir: &Path,
    session_key: &str,
    observe: F,
) -> SessionState
where
    F: FnOnce(SessionState) -> Fut,
    Fut: std::future::Future<Output = Result<SessionState, String>>,
{
    let state = match load_session_state(workspace_dir, session_key).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("beforeCompaction: failed to load session state: {e}");
            SessionState::default()
        }
    };

    match observe(state.clone()).await {
        Ok(updated) => {
            if let Err(e) = save_session_state(workspace_dir, session_key, &updated).await {
                tracing::warn!("beforeCompaction: failed to save session state: {e}");
            }
            updated
        }
        Err(e) => {
            tracing::warn!("beforeCompaction: forced observation failed: {e}");
            state
        }
    }
}
