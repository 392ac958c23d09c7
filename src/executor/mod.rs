//! Agent execution seam
//!
//! The engine never produces code itself. Each phase of a cycle is handed to
//! an [`AgentExecutor`] together with the agent lent out for it; the executor
//! talks to whatever AI backend is configured and returns the files it wants
//! to write.

pub mod retry;

use crate::models::{AgentHandle, CycleId, CyclePhase};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// One phase of work for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub cycle_id: CycleId,
    pub story_id: String,
    pub story_title: String,
    pub phase: CyclePhase,
    /// Files the story declared
    pub files: Vec<String>,
    /// Current view of each file: staged content if any, else the stored content
    pub base_contents: BTreeMap<String, String>,
    /// Context tokens the agent may spend on this phase
    pub token_budget: u64,
    /// Set when the budget could not grow and the agent must compress its context
    pub compress_context: bool,
}

/// Measured compute usage of one execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub memory_mb: u64,
    pub cpu_share: f64,
}

/// Result of one phase
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    /// Full new contents of every file the agent changed
    pub writes: BTreeMap<String, String>,
    pub tokens_used: u64,
    pub usage: Option<UsageSample>,
    pub summary: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent backend error: {0}")]
    Backend(String),

    /// The phase needs more context than its budget allows
    #[error("Context budget exceeded: needed {needed} tokens, allowed {allowed}")]
    ContextOverflow { needed: u64, allowed: u64 },

    #[error("Agent timed out after {0}s")]
    Timeout(u64),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Backend(message) => retry::is_retryable_error(message),
            AgentError::Timeout(_) => true,
            AgentError::ContextOverflow { .. } => false,
        }
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError>;
}

/// Executor that performs no work: no writes, a nominal token spend
pub struct DryRunExecutor;

#[async_trait]
impl AgentExecutor for DryRunExecutor {
    async fn execute(&self, agent: &AgentHandle, task: AgentTask) -> Result<AgentOutput, AgentError> {
        log::debug!(
            "[Executor] Dry run: {} would run {} for {}",
            agent.id,
            task.phase,
            task.cycle_id
        );
        Ok(AgentOutput {
            writes: BTreeMap::new(),
            tokens_used: (task.token_budget / 10).max(1),
            usage: None,
            summary: format!("dry run of {} by {}", task.phase, agent.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRole;

    fn agent() -> AgentHandle {
        AgentHandle {
            id: "code-1".to_string(),
            role: AgentRole::Code,
            capabilities: vec![],
            tools: vec![],
            security_level: 1,
            memory_mb: 1024,
            cpu_share: 1.0,
        }
    }

    #[test]
    fn test_error_retryability() {
        assert!(AgentError::Backend("429 too many requests".into()).is_retryable());
        assert!(!AgentError::Backend("bad request".into()).is_retryable());
        assert!(AgentError::Timeout(30).is_retryable());
        assert!(!AgentError::ContextOverflow { needed: 10, allowed: 5 }.is_retryable());
    }

    #[tokio::test]
    async fn test_dry_run_executor() {
        let task = AgentTask {
            cycle_id: "cyc-1".into(),
            story_id: "S-1".into(),
            story_title: "Story".into(),
            phase: CyclePhase::Design,
            files: vec!["a.x".into()],
            base_contents: BTreeMap::new(),
            token_budget: 1000,
            compress_context: false,
        };
        let output = DryRunExecutor.execute(&agent(), task).await.unwrap();
        assert!(output.writes.is_empty());
        assert_eq!(output.tokens_used, 100);
    }
}
