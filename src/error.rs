//! Switchboard error types

use thiserror::Error;

use crate::types::AgentId;

/// Errors that can occur in the escalation core
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// Initial query record failed validation; rejected before any side effect
    #[error("Invalid query record: {0}")]
    Validation(String),

    /// A pipeline node failed; the workflow halts with a partial record
    #[error("Node '{node}' failed: {message}")]
    NodeProcessing { node: String, message: String },

    /// Assignment lost a commit race or the worker no longer qualifies
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(AgentId),

    /// Invalid configuration, e.g. a weight set that does not sum to 1.0
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unknown session or worker id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The workflow was cancelled between node invocations
    #[error("cancelled")]
    Cancelled,

    /// Event channel error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl SwitchboardError {
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeProcessing {
            node: node.into(),
            message: message.into(),
        }
    }
}
